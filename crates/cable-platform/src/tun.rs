//! Tunnel device access.
//!
//! One IP packet per read, one per write. The backend is chosen at compile
//! time: Linux (`/dev/net/tun`), Apple (`utun` control sockets), or generic
//! BSD (`/dev/tunN`). Apple and BSD devices frame each packet with a 4-byte
//! address-family header; that header never escapes this module.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;

#[cfg(target_os = "linux")]
#[path = "tun_linux.rs"]
mod sys;
#[cfg(any(target_os = "macos", target_os = "ios"))]
#[path = "tun_apple.rs"]
mod sys;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
#[path = "tun_bsd.rs"]
mod sys;

/// Error type for tunnel device operations.
#[derive(Debug, thiserror::Error)]
pub enum TunError {
    #[error("cannot open tunnel device: {0}")]
    Open(#[source] io::Error),
    #[error("this platform requires an explicit tun device name (e.g. tun0)")]
    NameRequired,
    #[error("device name {0:?} does not name a usable tunnel device")]
    BadName(String),
    #[error("device ioctl failed: {0}")]
    Ioctl(#[source] io::Error),
    #[error("tunnel i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("packet has unknown IP version nibble {0}")]
    BadIpVersion(u8),
}

/// An open tunnel device registered with the async runtime.
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
}

impl TunDevice {
    /// Open the device named by `name_hint`, or let the platform pick one
    /// when `None`. BSD-family platforms require an explicit name.
    pub fn open(name_hint: Option<&str>) -> Result<Self, TunError> {
        let (fd, name) = sys::open(name_hint)?;
        set_nonblocking(&fd)?;
        let fd = AsyncFd::new(fd).map_err(TunError::Io)?;
        tracing::info!(device = %name, "tunnel device open");
        Ok(Self { fd, name })
    }

    /// The kernel-assigned device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the device MTU.
    pub fn set_mtu(&self, mtu: u32) -> Result<(), TunError> {
        sys::set_mtu(&self.name, mtu)
    }

    /// Read one IP packet into `buf`; returns its length.
    ///
    /// No deadline: an idle tunnel is normal and must not fail the session.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TunError> {
        loop {
            let mut guard = self.fd.readable().await.map_err(TunError::Io)?;
            let result = guard.try_io(|inner| {
                if sys::AF_HEADER {
                    read_with_af_header(inner.get_ref().as_raw_fd(), buf)
                } else {
                    read_packet(inner.get_ref().as_raw_fd(), buf)
                }
            });
            match result {
                Ok(Ok(0)) => continue, // header-only read, nothing usable
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) => return Err(TunError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Inject one IP packet into the device.
    ///
    /// Packets shorter than an IP header are silently ignored, matching the
    /// device's own behavior for runt frames.
    pub async fn send(&mut self, packet: &[u8]) -> Result<(), TunError> {
        if packet.len() < 20 {
            return Ok(());
        }
        let family = if sys::AF_HEADER {
            Some(af_word(packet[0] >> 4)?)
        } else {
            None
        };
        loop {
            let mut guard = self.fd.writable().await.map_err(TunError::Io)?;
            let result = guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                match family {
                    Some(word) => write_with_af_header(fd, word, packet),
                    None => write_packet(fd, packet),
                }
            });
            match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => return Err(TunError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// The address-family word Apple/BSD devices expect in front of each packet.
fn af_word(version: u8) -> Result<[u8; 4], TunError> {
    let family: u32 = match version {
        4 => libc::AF_INET as u32,
        6 => libc::AF_INET6 as u32,
        v => return Err(TunError::BadIpVersion(v)),
    };
    Ok(family.to_be_bytes())
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), TunError> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(TunError::Io(io::Error::last_os_error()));
    }
    let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(TunError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn read_packet(fd: libc::c_int, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn write_packet(fd: libc::c_int, packet: &[u8]) -> io::Result<()> {
    let n = unsafe { libc::write(fd, packet.as_ptr() as *const libc::c_void, packet.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Read one packet, stripping the leading 4-byte address-family word.
fn read_with_af_header(fd: libc::c_int, buf: &mut [u8]) -> io::Result<usize> {
    let mut family = [0u8; 4];
    let mut iov = [
        libc::iovec {
            iov_base: family.as_mut_ptr() as *mut libc::c_void,
            iov_len: family.len(),
        },
        libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        },
    ];
    let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), 2) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((n as usize).saturating_sub(family.len()))
}

/// Write one packet behind the address-family word the device expects.
fn write_with_af_header(fd: libc::c_int, family: [u8; 4], packet: &[u8]) -> io::Result<()> {
    let iov = [
        libc::iovec {
            iov_base: family.as_ptr() as *mut libc::c_void,
            iov_len: family.len(),
        },
        libc::iovec {
            iov_base: packet.as_ptr() as *mut libc::c_void,
            iov_len: packet.len(),
        },
    ];
    let n = unsafe { libc::writev(fd, iov.as_ptr(), 2) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn af_word_maps_ip_versions() {
        assert_eq!(af_word(4).unwrap(), (libc::AF_INET as u32).to_be_bytes());
        assert_eq!(af_word(6).unwrap(), (libc::AF_INET6 as u32).to_be_bytes());
        assert!(matches!(af_word(5), Err(TunError::BadIpVersion(5))));
    }
}
