//! Wire transport for the cable tunnel.
//!
//! Deadline-bounded I/O primitives, the encrypted frame codec, the TLS-shaped
//! cover preamble, outer-socket tuning, and session state tracking. Nothing
//! in this crate touches key material beyond carrying sealed frames.

pub mod connection;
pub mod framing;
pub mod io;
pub mod preamble;
pub mod sockopt;

pub use connection::*;
pub use framing::*;
pub use io::*;
pub use preamble::*;
pub use sockopt::*;
