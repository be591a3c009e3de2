//! Default-route discovery.
//!
//! Resolves the machine's default gateway and egress interface by running
//! the platform's routing tool and parsing its output here; used to fill in
//! the `auto` CLI placeholders before routes are rewritten.

use crate::cmd::{self, CmdError};

/// The machine's default route, as far as it could be discovered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: Option<String>,
    pub interface: Option<String>,
}

/// Discover the default gateway and egress interface.
pub async fn discover() -> Result<DefaultRoute, CmdError> {
    #[cfg(target_os = "linux")]
    {
        let out = cmd::run_capture("ip", &["route", "show", "default"]).await?;
        Ok(parse_ip_route(&out))
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        let out = cmd::run_capture("route", &["-n", "get", "default"]).await?;
        Ok(parse_route_get(&out))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    {
        let out = cmd::run_capture("netstat", &["-rn"]).await?;
        Ok(parse_netstat(&out))
    }
}

/// `ip route show default` → `default via 192.0.2.1 dev eth0 proto dhcp ...`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ip_route(output: &str) -> DefaultRoute {
    let mut route = DefaultRoute::default();
    let Some(line) = output.lines().find(|l| l.starts_with("default")) else {
        return route;
    };
    let mut words = line.split_whitespace().peekable();
    while let Some(word) = words.next() {
        match word {
            "via" => route.gateway = words.peek().map(|w| w.to_string()),
            "dev" => route.interface = words.peek().map(|w| w.to_string()),
            _ => {}
        }
    }
    route
}

/// `route -n get default` → indented `gateway:` / `interface:` lines.
#[cfg_attr(not(any(target_os = "macos", target_os = "ios")), allow(dead_code))]
fn parse_route_get(output: &str) -> DefaultRoute {
    let mut route = DefaultRoute::default();
    for line in output.lines() {
        let line = line.trim();
        if let Some(gw) = line.strip_prefix("gateway:") {
            route.gateway.get_or_insert_with(|| gw.trim().to_string());
        } else if let Some(ifname) = line.strip_prefix("interface:") {
            route
                .interface
                .get_or_insert_with(|| ifname.trim().to_string());
        }
    }
    route
}

/// `netstat -rn` → `default  192.0.2.1  UGS ... em0`
#[cfg_attr(
    any(target_os = "linux", target_os = "macos", target_os = "ios"),
    allow(dead_code)
)]
fn parse_netstat(output: &str) -> DefaultRoute {
    let mut route = DefaultRoute::default();
    let Some(line) = output.lines().find(|l| l.starts_with("default")) else {
        return route;
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    route.gateway = fields.get(1).map(|w| w.to_string());
    route.interface = fields.last().map(|w| w.to_string());
    route
}
