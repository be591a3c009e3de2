//! Deadline-bounded I/O primitives.
//!
//! Socket reads and writes must make progress within a deadline or the
//! session is torn down; tunnel-device I/O deliberately has no deadline (an
//! idle tunnel is normal, only socket silence is fatal, and that is judged by
//! the keepalive logic a layer up). Interrupted syscalls are retried by the
//! runtime; short reads and writes are retried here.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Baseline deadline for socket operations.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for deadline-bounded I/O.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the stream")]
    Eof,
    #[error("i/o deadline of {0:?} elapsed")]
    Timeout(Duration),
}

/// Read exactly `buf.len()` bytes, or fail with `Eof` / `Timeout` / `Io`.
pub async fn read_exact<R>(io: &mut R, buf: &mut [u8], timeout: Duration) -> Result<(), IoError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, io.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(IoError::Eof),
        Ok(Err(e)) => Err(IoError::Io(e)),
        Err(_) => Err(IoError::Timeout(timeout)),
    }
}

/// Write all of `buf`, retrying partial writes, or fail with `Timeout` / `Io`.
pub async fn write_all<W>(io: &mut W, buf: &[u8], timeout: Duration) -> Result<(), IoError>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, io.write_all(buf)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(IoError::Io(e)),
        Err(_) => Err(IoError::Timeout(timeout)),
    }
}
