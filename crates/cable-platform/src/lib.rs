//! Platform capability layer.
//!
//! Everything that talks to the operating system on the tunnel's behalf:
//! the tun device (Linux, Apple, generic BSD backends selected at build
//! time), default-route discovery, and the firewall/route rule sets with
//! their substitution-and-dispatch machinery. The data plane consumes only
//! the narrow contracts exposed here and never shells out itself.

pub mod cmd;
pub mod route;
pub mod rules;
pub mod tun;

pub use route::DefaultRoute;
pub use rules::{RuleSubstitutions, RulesError};
pub use tun::{TunDevice, TunError};
