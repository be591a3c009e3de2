//! Runtime configuration context.
//!
//! One `Config` is built from the command line at startup and threaded
//! explicitly through everything that needs it; there is no process-global
//! state. Timeout constants live here because they define protocol behavior,
//! not transport mechanics.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::Error;

/// Default tunnel MTU; large frames amortize the per-packet overhead.
pub const DEFAULT_MTU: u16 = 9000;

/// Idle time after which a heartbeat frame is emitted.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound silence after which the peer is declared gone.
pub const PEER_SILENCE_LIMIT: Duration = Duration::from_secs(90);

/// Bound on the whole handshake, preamble through initial heartbeat.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Which end of the tunnel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Everything the process needs to run, resolved from the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub key_file: PathBuf,
    /// Listen address (server) or server address (client), as `host:port`.
    pub peer_addr: String,
    /// Tunnel device name; `None` lets the platform pick.
    pub tun_name: Option<String>,
    /// External (egress) interface; `None` means discover it.
    pub ext_if: Option<String>,
    pub local_tun_ip: Ipv4Addr,
    pub remote_tun_ip: Ipv4Addr,
    /// Client only: gateway override; `None` means discover it.
    pub ext_gw_ip: Option<Ipv4Addr>,
    pub mtu: u16,
}

impl Config {
    /// Reject combinations that cannot work before any setup runs.
    pub fn validate(&self) -> Result<(), Error> {
        if self.local_tun_ip == self.remote_tun_ip {
            return Err(Error::config(
                "local and remote tunnel addresses must differ",
            ));
        }
        if self.mtu < 576 {
            return Err(Error::config("mtu below the IPv4 minimum of 576"));
        }
        Ok(())
    }

    /// IPv6 tunnel address for this side: the IPv4 address mapped into the
    /// NAT64 well-known prefix.
    pub fn local_tun_ip6(&self) -> Ipv6Addr {
        nat64(self.local_tun_ip)
    }

    /// IPv6 tunnel address for the peer side.
    pub fn remote_tun_ip6(&self) -> Ipv6Addr {
        nat64(self.remote_tun_ip)
    }
}

fn nat64(v4: Ipv4Addr) -> Ipv6Addr {
    let o = v4.octets();
    Ipv6Addr::new(
        0x64,
        0xff9b,
        0,
        0,
        0,
        0,
        u16::from_be_bytes([o[0], o[1]]),
        u16::from_be_bytes([o[2], o[3]]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            role: Role::Client,
            key_file: PathBuf::from("/etc/cable.key"),
            peer_addr: "vpn.example.org:443".into(),
            tun_name: None,
            ext_if: None,
            local_tun_ip: Ipv4Addr::new(192, 168, 192, 1),
            remote_tun_ip: Ipv4Addr::new(192, 168, 192, 254),
            ext_gw_ip: None,
            mtu: DEFAULT_MTU,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn identical_tunnel_ips_rejected() {
        let mut bad = config();
        bad.remote_tun_ip = bad.local_tun_ip;
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn tiny_mtu_rejected() {
        let mut bad = config();
        bad.mtu = 100;
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn tunnel_ip6_uses_the_nat64_prefix() {
        let cfg = config();
        assert_eq!(
            cfg.local_tun_ip6().to_string(),
            "64:ff9b::c0a8:c001"
        );
        assert_eq!(
            cfg.remote_tun_ip6().to_string(),
            "64:ff9b::c0a8:c0fe"
        );
    }
}
