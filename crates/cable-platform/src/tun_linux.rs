//! Linux tun backend: `/dev/net/tun` + `TUNSETIFF`.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use crate::tun::TunError;

/// Linux tun devices deliver bare IP packets (`IFF_NO_PI`).
pub const AF_HEADER: bool = false;

const IFNAMSIZ: usize = 16;

// <linux/if_tun.h>
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
// <bits/ioctls.h>
const SIOCSIFMTU: libc::c_ulong = 0x8922;

#[repr(C)]
struct IfReqFlags {
    name: [u8; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

#[repr(C)]
struct IfReqMtu {
    name: [u8; IFNAMSIZ],
    mtu: libc::c_int,
    _pad: [u8; 20],
}

fn copy_name(dst: &mut [u8; IFNAMSIZ], name: &str) -> Result<(), TunError> {
    let bytes = name.as_bytes();
    if bytes.len() >= IFNAMSIZ {
        return Err(TunError::BadName(name.to_string()));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

pub fn open(name_hint: Option<&str>) -> Result<(OwnedFd, String), TunError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(TunError::Open)?;

    let mut req = IfReqFlags {
        name: [0u8; IFNAMSIZ],
        flags: IFF_TUN | IFF_NO_PI,
        _pad: [0u8; 22],
    };
    if let Some(name) = name_hint {
        copy_name(&mut req.name, name)?;
    }
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut req) };
    if rc < 0 {
        return Err(TunError::Ioctl(io::Error::last_os_error()));
    }

    let end = req.name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
    let name = String::from_utf8_lossy(&req.name[..end]).into_owned();
    Ok((OwnedFd::from(file), name))
}

pub fn set_mtu(name: &str, mtu: u32) -> Result<(), TunError> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(TunError::Io(io::Error::last_os_error()));
    }
    let mut req = IfReqMtu {
        name: [0u8; IFNAMSIZ],
        mtu: mtu as libc::c_int,
        _pad: [0u8; 20],
    };
    let named = copy_name(&mut req.name, name);
    let rc = match named {
        Ok(()) => unsafe { libc::ioctl(sock, SIOCSIFMTU, &mut req) },
        Err(_) => -1,
    };
    let saved = io::Error::last_os_error();
    unsafe { libc::close(sock) };
    named?;
    if rc < 0 {
        return Err(TunError::Ioctl(saved));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlong_device_name_rejected() {
        let mut name = [0u8; IFNAMSIZ];
        assert!(copy_name(&mut name, "a-device-name-way-too-long").is_err());
        assert!(copy_name(&mut name, "tun0").is_ok());
        assert_eq!(&name[..4], b"tun0");
    }
}
