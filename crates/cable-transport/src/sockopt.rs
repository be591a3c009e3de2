//! Outer TCP socket tuning.
//!
//! Applied to every outer socket on both roles: keepalive, quick ACKs (or
//! Nagle off where QUICKACK does not exist), BBR congestion control, and a
//! not-sent low-water mark to keep kernel send queues short. Everything is
//! best-effort; a platform that rejects an option just runs without it.

use tokio::net::TcpStream;
use tracing::debug;

/// Low-water mark for unsent bytes, where the platform supports it.
pub const NOTSENT_LOWAT: u32 = 128 * 1024;

#[cfg(target_os = "linux")]
const CONGESTION_ALG: &[u8] = b"bbr";

/// Tune an established outer socket.
pub fn tune(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_keepalive(true) {
        debug!(error = %e, "SO_KEEPALIVE not applied");
    }

    #[cfg(target_os = "linux")]
    linux_opts(stream);

    #[cfg(not(target_os = "linux"))]
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "TCP_NODELAY not applied");
    }
}

#[cfg(target_os = "linux")]
fn linux_opts(stream: &TcpStream) {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    set_int(fd, libc::TCP_QUICKACK, 1, "TCP_QUICKACK");
    set_bytes(fd, libc::TCP_CONGESTION, CONGESTION_ALG, "TCP_CONGESTION");
    set_int(
        fd,
        libc::TCP_NOTSENT_LOWAT,
        NOTSENT_LOWAT as libc::c_int,
        "TCP_NOTSENT_LOWAT",
    );
}

#[cfg(target_os = "linux")]
fn set_int(fd: std::os::fd::RawFd, opt: libc::c_int, value: libc::c_int, name: &str) {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            opt,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        debug!(option = name, "socket option not applied");
    }
}

#[cfg(target_os = "linux")]
fn set_bytes(fd: std::os::fd::RawFd, opt: libc::c_int, value: &[u8], name: &str) {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            opt,
            value.as_ptr() as *const libc::c_void,
            value.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        debug!(option = name, "socket option not applied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tuning_an_established_socket_does_not_fail() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        // Best-effort by contract: must not panic on any platform.
        tune(&client);
        tune(&server);
    }
}
