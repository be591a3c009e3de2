//! Generic BSD tun backend: `/dev/tunN`, explicit name required.

use std::fs::OpenOptions;
use std::os::fd::OwnedFd;

use crate::tun::TunError;

/// BSD tun devices frame each packet with a 4-byte address-family word.
pub const AF_HEADER: bool = true;

pub fn open(name_hint: Option<&str>) -> Result<(OwnedFd, String), TunError> {
    let name = name_hint.ok_or(TunError::NameRequired)?;
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric())
    {
        return Err(TunError::BadName(name.to_string()));
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("/dev/{name}"))
        .map_err(TunError::Open)?;
    Ok((OwnedFd::from(file), name.to_string()))
}

/// MTU configuration is left to the route/ifconfig rule set on these
/// platforms; the ioctl layout differs per BSD flavor.
pub fn set_mtu(_name: &str, _mtu: u32) -> Result<(), TunError> {
    Ok(())
}
