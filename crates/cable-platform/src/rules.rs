//! Firewall and route configuration.
//!
//! Per-platform command template sets, with `$VAR` placeholders substituted
//! from the tunnel's addressing before dispatch. Templates are split into
//! argv tokens first and substituted token by token, so an address can never
//! change the shape of a command. Set commands run at startup and must all
//! succeed; unset commands run at teardown and failures are only logged.

use tracing::warn;

use crate::cmd::{self, CmdError};

/// Which end of the tunnel the rules configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleRole {
    Server,
    Client,
}

/// Error type for rule application.
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error(transparent)]
    Cmd(#[from] CmdError),
    #[error("no rule set is defined for this platform")]
    UnsupportedPlatform,
}

/// Values substituted into the rule templates.
#[derive(Debug, Clone)]
pub struct RuleSubstitutions {
    pub if_name: String,
    pub local_tun_ip: String,
    pub remote_tun_ip: String,
    pub local_tun_ip6: String,
    pub remote_tun_ip6: String,
    pub ext_if_name: String,
    pub ext_ip: String,
    pub ext_gw_ip: String,
}

impl RuleSubstitutions {
    /// Placeholder/value pairs, longest placeholder first so that
    /// `$LOCAL_TUN_IP` never swallows the prefix of `$LOCAL_TUN_IP6`.
    fn pairs(&self) -> [(&'static str, &str); 8] {
        [
            ("$LOCAL_TUN_IP6", &self.local_tun_ip6),
            ("$REMOTE_TUN_IP6", &self.remote_tun_ip6),
            ("$LOCAL_TUN_IP", &self.local_tun_ip),
            ("$REMOTE_TUN_IP", &self.remote_tun_ip),
            ("$EXT_IF_NAME", &self.ext_if_name),
            ("$EXT_GW_IP", &self.ext_gw_ip),
            ("$EXT_IP", &self.ext_ip),
            ("$IF_NAME", &self.if_name),
        ]
    }
}

/// One platform/role rule set: set at startup, unset at teardown.
pub struct RuleSet {
    set: &'static [&'static str],
    unset: &'static [&'static str],
}

#[cfg(target_os = "linux")]
const SERVER_SET: &[&str] = &[
    "sysctl net.ipv4.ip_forward=1",
    "ip addr add $LOCAL_TUN_IP peer $REMOTE_TUN_IP dev $IF_NAME",
    "ip link set dev $IF_NAME up",
    "iptables -t nat -A POSTROUTING -o $EXT_IF_NAME -s $REMOTE_TUN_IP -j MASQUERADE",
    "iptables -t filter -A FORWARD -i $EXT_IF_NAME -o $IF_NAME -m state --state RELATED,ESTABLISHED -j ACCEPT",
    "iptables -t filter -A FORWARD -i $IF_NAME -o $EXT_IF_NAME -j ACCEPT",
];

#[cfg(target_os = "linux")]
const SERVER_UNSET: &[&str] = &[
    "iptables -t nat -D POSTROUTING -o $EXT_IF_NAME -s $REMOTE_TUN_IP -j MASQUERADE",
    "iptables -t filter -D FORWARD -i $EXT_IF_NAME -o $IF_NAME -m state --state RELATED,ESTABLISHED -j ACCEPT",
    "iptables -t filter -D FORWARD -i $IF_NAME -o $EXT_IF_NAME -j ACCEPT",
];

#[cfg(target_os = "linux")]
const CLIENT_SET: &[&str] = &[
    "sysctl net.ipv4.tcp_congestion_control=bbr",
    "ip link set dev $IF_NAME up",
    "ip addr add $LOCAL_TUN_IP peer $REMOTE_TUN_IP dev $IF_NAME",
    "ip -6 addr add $LOCAL_TUN_IP6 peer $REMOTE_TUN_IP6 dev $IF_NAME",
    "ip route add $EXT_IP via $EXT_GW_IP",
    "ip route add 0/1 via $REMOTE_TUN_IP",
    "ip route add 128/1 via $REMOTE_TUN_IP",
    "ip -6 route add 0000::/1 via $REMOTE_TUN_IP6",
    "ip -6 route add 8000::/1 via $REMOTE_TUN_IP6",
];

#[cfg(target_os = "linux")]
const CLIENT_UNSET: &[&str] = &["ip route del $EXT_IP via $EXT_GW_IP"];

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd"
))]
const CLIENT_SET: &[&str] = &[
    "ifconfig $IF_NAME $LOCAL_TUN_IP $REMOTE_TUN_IP up",
    "ifconfig $IF_NAME inet6 $LOCAL_TUN_IP6 $REMOTE_TUN_IP6 prefixlen 128 up",
    "route add $EXT_IP $EXT_GW_IP",
    "route add 0/1 $REMOTE_TUN_IP",
    "route add 128/1 $REMOTE_TUN_IP",
    "route add -inet6 -blackhole 0000::/1 $REMOTE_TUN_IP6",
    "route add -inet6 -blackhole 8000::/1 $REMOTE_TUN_IP6",
];

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd"
))]
const CLIENT_UNSET: &[&str] = &["route delete $EXT_IP $EXT_GW_IP"];

/// The rule set for `role` on this platform, if one is defined.
pub fn rules_for(role: RuleRole) -> Result<RuleSet, RulesError> {
    match role {
        #[cfg(target_os = "linux")]
        RuleRole::Server => Ok(RuleSet {
            set: SERVER_SET,
            unset: SERVER_UNSET,
        }),
        #[cfg(target_os = "linux")]
        RuleRole::Client => Ok(RuleSet {
            set: CLIENT_SET,
            unset: CLIENT_UNSET,
        }),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "openbsd"
        ))]
        RuleRole::Client => Ok(RuleSet {
            set: CLIENT_SET,
            unset: CLIENT_UNSET,
        }),
        #[allow(unreachable_patterns)]
        _ => Err(RulesError::UnsupportedPlatform),
    }
}

/// Split a template into argv tokens and substitute placeholders.
pub fn substitute(template: &str, subs: &RuleSubstitutions) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| {
            let mut token = token.to_string();
            for (placeholder, value) in subs.pairs() {
                if token.contains(placeholder) {
                    token = token.replace(placeholder, value);
                }
            }
            token
        })
        .collect()
}

impl RuleSet {
    /// Apply all set commands; the first failure aborts setup.
    pub async fn apply(&self, subs: &RuleSubstitutions) -> Result<(), RulesError> {
        for template in self.set {
            let argv = substitute(template, subs);
            cmd::run(&argv[0], &argv[1..]).await?;
        }
        Ok(())
    }

    /// Run all unset commands; failures are logged and skipped so teardown
    /// always finishes.
    pub async fn teardown(&self, subs: &RuleSubstitutions) {
        for template in self.unset {
            let argv = substitute(template, subs);
            if let Err(e) = cmd::run(&argv[0], &argv[1..]).await {
                warn!(command = template, error = %e, "teardown command failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subs() -> RuleSubstitutions {
        RuleSubstitutions {
            if_name: "tun0".into(),
            local_tun_ip: "192.168.192.1".into(),
            remote_tun_ip: "192.168.192.254".into(),
            local_tun_ip6: "64:ff9b::c0a8:c001".into(),
            remote_tun_ip6: "64:ff9b::c0a8:c0fe".into(),
            ext_if_name: "eth0".into(),
            ext_ip: "198.51.100.7".into(),
            ext_gw_ip: "198.51.100.1".into(),
        }
    }

    #[test]
    fn substitution_fills_every_placeholder() {
        let argv = substitute(
            "ip addr add $LOCAL_TUN_IP peer $REMOTE_TUN_IP dev $IF_NAME",
            &subs(),
        );
        assert_eq!(
            argv,
            vec![
                "ip",
                "addr",
                "add",
                "192.168.192.1",
                "peer",
                "192.168.192.254",
                "dev",
                "tun0"
            ]
        );
    }

    #[test]
    fn ip6_placeholders_are_not_clobbered_by_their_ip4_prefix() {
        let argv = substitute(
            "ip -6 addr add $LOCAL_TUN_IP6 peer $REMOTE_TUN_IP6 dev $IF_NAME",
            &subs(),
        );
        assert_eq!(argv[4], "64:ff9b::c0a8:c001");
        assert_eq!(argv[6], "64:ff9b::c0a8:c0fe");
    }

    #[test]
    fn ext_ip_and_gateway_stay_distinct() {
        let argv = substitute("ip route add $EXT_IP via $EXT_GW_IP", &subs());
        assert_eq!(argv[3], "198.51.100.7");
        assert_eq!(argv[5], "198.51.100.1");
    }

    #[test]
    fn tokens_without_placeholders_pass_through() {
        let argv = substitute("sysctl net.ipv4.ip_forward=1", &subs());
        assert_eq!(argv, vec!["sysctl", "net.ipv4.ip_forward=1"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_has_rules_for_both_roles() {
        assert!(rules_for(RuleRole::Server).is_ok());
        assert!(rules_for(RuleRole::Client).is_ok());
    }
}
