//! Core of the cable tunnel: the session state machine (handshake + packet
//! shuttle), the server's one-active-session manager, the client's reconnect
//! controller, and the configuration context that wires them together.

pub mod client;
pub mod config;
pub mod errors;
pub mod server;
pub mod session;
pub mod testing;

pub use client::Client;
pub use config::{Config, Role};
pub use errors::{Error, Result};
pub use server::Server;
pub use session::{PacketIo, Session};
