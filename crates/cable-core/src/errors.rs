//! Error taxonomy for the tunnel core.
//!
//! Everything a session can die of, folded into one enum. The crypto,
//! transport, and platform crates keep their own typed errors; the bridges
//! below decide which taxonomy bucket each one lands in.

use cable_crypto::psk::PskError;
use cable_crypto::replay::ReplayError;
use cable_crypto::schedule::ScheduleError;
use cable_crypto::seal::{OpenError, SealError};
use cable_platform::rules::RulesError;
use cable_platform::tun::TunError;
use cable_transport::framing::FramingError;
use cable_transport::io::IoError;
use cable_transport::preamble::PreambleError;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Why a session (or the process, for `Config`) failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("peer closed the connection")]
    Eof,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("frame authentication failed")]
    AuthFail,
    #[error("replayed frame: {0}")]
    Replay(ReplayError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("outbound nonce space exhausted")]
    NonceExhausted,
    #[error("peer silent beyond the keepalive horizon")]
    PeerSilent,
    #[error("configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        match e {
            IoError::Io(e) => Error::Io(e),
            IoError::Eof => Error::Eof,
            IoError::Timeout(_) => Error::Timeout,
        }
    }
}

impl From<OpenError> for Error {
    fn from(e: OpenError) -> Self {
        match e {
            OpenError::Auth => Error::AuthFail,
            OpenError::Replay(r) => Error::Replay(r),
        }
    }
}

impl From<SealError> for Error {
    fn from(e: SealError) -> Self {
        match e {
            SealError::CounterExhausted => Error::NonceExhausted,
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<PreambleError> for Error {
    fn from(e: PreambleError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<ScheduleError> for Error {
    fn from(e: ScheduleError) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<PskError> for Error {
    fn from(e: PskError) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<RulesError> for Error {
    fn from(e: RulesError) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<TunError> for Error {
    fn from(e: TunError) -> Self {
        match e {
            // Setup-time failures: the operator gave us something unusable.
            TunError::Open(_) | TunError::NameRequired | TunError::BadName(_) => {
                Error::Config(e.to_string())
            }
            TunError::Io(io) => Error::Io(io),
            TunError::Ioctl(io) => Error::Io(io),
            TunError::BadIpVersion(v) => Error::Protocol(format!("ip version nibble {v}")),
        }
    }
}
