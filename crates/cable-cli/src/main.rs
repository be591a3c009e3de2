//! `cable`: a point-to-point encrypted IP tunnel over a single TCP
//! connection. One binary serves both roles: the server waits for a client,
//! the client keeps a session alive against a server, and both shuttle
//! packets through a local tun device.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cable_core::config::DEFAULT_MTU;
use cable_core::{Client, Config, Role, Server};
use cable_crypto::psk::PreSharedKey;
use cable_platform::rules::{self, RuleRole, RuleSubstitutions};
use cable_platform::{route, TunDevice};

#[derive(Parser)]
#[command(name = "cable", about = "Point-to-point encrypted IP tunnel over TCP")]
struct Args {
    /// Key file holding 64 hex characters, identical on both peers.
    key_file: PathBuf,

    #[command(subcommand)]
    mode: Mode,

    /// Tunnel MTU.
    #[arg(long, default_value_t = DEFAULT_MTU)]
    mtu: u16,

    /// Log filter, overridden by RUST_LOG.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Mode {
    /// Listen for a client and serve the tunnel.
    Server {
        /// Tunnel device name, or "auto".
        if_name: String,
        /// Address to listen on, host:port.
        addr: String,
        /// External (egress) interface, or "auto".
        ext_if: String,
        /// This side's tunnel address.
        local_tun_ip: Ipv4Addr,
        /// The peer's tunnel address.
        remote_tun_ip: Ipv4Addr,
    },
    /// Connect to a server and keep the tunnel alive.
    Client {
        /// Tunnel device name, or "auto".
        if_name: String,
        /// Server address, host:port.
        addr: String,
        /// External (egress) interface, or "auto".
        ext_if: String,
        /// This side's tunnel address.
        local_tun_ip: Ipv4Addr,
        /// The peer's tunnel address.
        remote_tun_ip: Ipv4Addr,
        /// Current default gateway; discovered when omitted.
        ext_gw_ip: Option<Ipv4Addr>,
    },
}

fn auto_opt(value: &str) -> Option<String> {
    if value == "auto" {
        None
    } else {
        Some(value.to_string())
    }
}

fn build_config(args: &Args) -> Config {
    match &args.mode {
        Mode::Server {
            if_name,
            addr,
            ext_if,
            local_tun_ip,
            remote_tun_ip,
        } => Config {
            role: Role::Server,
            key_file: args.key_file.clone(),
            peer_addr: addr.clone(),
            tun_name: auto_opt(if_name),
            ext_if: auto_opt(ext_if),
            local_tun_ip: *local_tun_ip,
            remote_tun_ip: *remote_tun_ip,
            ext_gw_ip: None,
            mtu: args.mtu,
        },
        Mode::Client {
            if_name,
            addr,
            ext_if,
            local_tun_ip,
            remote_tun_ip,
            ext_gw_ip,
        } => Config {
            role: Role::Client,
            key_file: args.key_file.clone(),
            peer_addr: addr.clone(),
            tun_name: auto_opt(if_name),
            ext_if: auto_opt(ext_if),
            local_tun_ip: *local_tun_ip,
            remote_tun_ip: *remote_tun_ip,
            ext_gw_ip: *ext_gw_ip,
            mtu: args.mtu,
        },
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    run(args).await
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = build_config(&args);
    config.validate()?;
    let psk = PreSharedKey::load(&config.key_file).context("loading key file")?;

    let mut tun =
        TunDevice::open(config.tun_name.as_deref()).context("opening tunnel device")?;
    if let Err(e) = tun.set_mtu(config.mtu as u32) {
        warn!(error = %e, "could not set tunnel MTU");
    }

    let subs = build_substitutions(&config, tun.name()).await?;
    let rule_role = match config.role {
        Role::Server => RuleRole::Server,
        Role::Client => RuleRole::Client,
    };
    let ruleset = rules::rules_for(rule_role)
        .context("no network configuration defined for this platform")?;
    ruleset
        .apply(&subs)
        .await
        .context("applying route/firewall rules")?;
    info!(device = %tun.name(), "tunnel configured");

    let result = match config.role {
        Role::Server => {
            let mut server = Server::bind(&config.peer_addr, psk, config.mtu).await?;
            info!(addr = %config.peer_addr, "listening");
            tokio::select! {
                res = server.run(&mut tun) => res,
                _ = shutdown_signal() => Ok(()),
            }
        }
        Role::Client => {
            let client = Client::new(config.peer_addr.clone(), psk, config.mtu);
            tokio::select! {
                res = client.run(&mut tun) => res,
                _ = shutdown_signal() => Ok(()),
            }
        }
    };

    info!("shutting down, removing rules");
    ruleset.teardown(&subs).await;
    result?;
    Ok(())
}

/// Fill the rule substitution set, discovering whatever the CLI left `auto`.
async fn build_substitutions(config: &Config, tun_name: &str) -> anyhow::Result<RuleSubstitutions> {
    let needs_gateway = config.role == Role::Client && config.ext_gw_ip.is_none();
    let needs_ext_if = config.role == Role::Server && config.ext_if.is_none();

    let discovered = if needs_gateway || needs_ext_if {
        route::discover()
            .await
            .context("discovering the default route")?
    } else {
        route::DefaultRoute::default()
    };

    let ext_if_name = match (&config.ext_if, discovered.interface) {
        (Some(name), _) => name.clone(),
        (None, Some(name)) => name,
        (None, None) if config.role == Role::Server => {
            bail!("no external interface given and none could be discovered")
        }
        (None, None) => String::new(),
    };

    let ext_gw_ip = match (config.ext_gw_ip, discovered.gateway) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(gw)) => gw,
        (None, None) if config.role == Role::Client => {
            bail!("no gateway given and none could be discovered")
        }
        (None, None) => String::new(),
    };

    // The host route that keeps the outer connection off the tunnel needs
    // the server's literal address.
    let ext_ip = match config.role {
        Role::Client => resolve_host_ip(&config.peer_addr)
            .await
            .context("resolving the server address")?
            .to_string(),
        Role::Server => String::new(),
    };

    Ok(RuleSubstitutions {
        if_name: tun_name.to_string(),
        local_tun_ip: config.local_tun_ip.to_string(),
        remote_tun_ip: config.remote_tun_ip.to_string(),
        local_tun_ip6: config.local_tun_ip6().to_string(),
        remote_tun_ip6: config.remote_tun_ip6().to_string(),
        ext_if_name,
        ext_ip,
        ext_gw_ip,
    })
}

async fn resolve_host_ip(addr: &str) -> anyhow::Result<IpAddr> {
    let mut addrs = tokio::net::lookup_host(addr).await?;
    match addrs.next() {
        Some(sock) => Ok(sock.ip()),
        None => bail!("{addr} did not resolve to any address"),
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("signal received");
}
