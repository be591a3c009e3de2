//! Apple utun backend: system-control sockets.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

use crate::tun::TunError;

/// utun frames every packet with a 4-byte address-family word.
pub const AF_HEADER: bool = true;

const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
// <sys/sockio.h>
const SIOCSIFMTU: libc::c_ulong = 0x8020_6934;

/// Highest utun unit probed when no name is given.
const MAX_AUTO_UNIT: u32 = 32;

pub fn open(name_hint: Option<&str>) -> Result<(OwnedFd, String), TunError> {
    match name_hint {
        None => {
            for unit in 0..MAX_AUTO_UNIT {
                if let Ok(pair) = open_unit(unit) {
                    return Ok(pair);
                }
            }
            Err(TunError::Open(io::Error::new(
                io::ErrorKind::AddrInUse,
                "no free utun unit",
            )))
        }
        Some(name) => {
            let unit = name
                .strip_prefix("utun")
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(|| TunError::BadName(name.to_string()))?;
            open_unit(unit)
        }
    }
}

fn open_unit(unit: u32) -> Result<(OwnedFd, String), TunError> {
    let fd = unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL) };
    if fd < 0 {
        return Err(TunError::Open(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut info: libc::ctl_info = unsafe { std::mem::zeroed() };
    for (dst, src) in info.ctl_name.iter_mut().zip(UTUN_CONTROL_NAME) {
        *dst = *src as libc::c_char;
    }
    let rc = unsafe {
        libc::ioctl(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            libc::CTLIOCGINFO,
            &mut info,
        )
    };
    if rc < 0 {
        return Err(TunError::Ioctl(io::Error::last_os_error()));
    }

    let mut addr: libc::sockaddr_ctl = unsafe { std::mem::zeroed() };
    addr.sc_len = std::mem::size_of::<libc::sockaddr_ctl>() as libc::c_uchar;
    addr.sc_family = libc::AF_SYSTEM as libc::c_uchar;
    addr.ss_sysaddr = libc::AF_SYS_CONTROL as u16;
    addr.sc_id = info.ctl_id;
    addr.sc_unit = unit + 1;

    let rc = unsafe {
        libc::connect(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            &addr as *const libc::sockaddr_ctl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ctl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(TunError::Open(io::Error::last_os_error()));
    }
    Ok((fd, format!("utun{unit}")))
}

pub fn set_mtu(name: &str, mtu: u32) -> Result<(), TunError> {
    const IFNAMSIZ: usize = 16;

    #[repr(C)]
    struct IfReqMtu {
        name: [u8; IFNAMSIZ],
        mtu: libc::c_int,
        _pad: [u8; 12],
    }

    let bytes = name.as_bytes();
    if bytes.len() >= IFNAMSIZ {
        return Err(TunError::BadName(name.to_string()));
    }
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(TunError::Io(io::Error::last_os_error()));
    }
    let mut req = IfReqMtu {
        name: [0u8; IFNAMSIZ],
        mtu: mtu as libc::c_int,
        _pad: [0u8; 12],
    };
    req.name[..bytes.len()].copy_from_slice(bytes);
    let rc = unsafe { libc::ioctl(sock, SIOCSIFMTU, &mut req) };
    let saved = io::Error::last_os_error();
    unsafe { libc::close(sock) };
    if rc < 0 {
        return Err(TunError::Ioctl(saved));
    }
    Ok(())
}
