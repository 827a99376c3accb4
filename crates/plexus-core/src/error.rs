//! Plexus error types.

use std::fmt;
use std::io;

use thiserror::Error;

/// Errors surfaced by the reactor, the layer stack and the flow adapters.
///
/// `Clone` so that a single failure can be stored in a buffer and handed to
/// every consumer that asks for it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// The peer closed the connection.
    #[error("socket disconnected")]
    SocketDisconnected,
    /// A socket syscall failed with the given errno.
    #[error("{op} failed: {}", OsCode(*.code))]
    SocketOperationFailed { op: &'static str, code: i32 },
    /// The peer sent bytes that do not parse.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A layer could not continue (e.g. a resource could not be opened).
    #[error("runtime error: {0}")]
    Runtime(String),
    /// A layer contract was violated.
    #[error("logic error: {0}")]
    Logic(String),
    /// Controlled shutdown of a socket manager.
    #[error("disposed")]
    Disposed,
    /// The acceptor reached its configured connection limit.
    #[error("connection limit reached")]
    ConnectionLimit,
    /// The opposite end of a buffer went away.
    #[error("cancelled")]
    Cancelled,
    /// A settings value is out of range or unusable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl NetError {
    /// Builds a `SocketOperationFailed` from the calling thread's errno.
    pub fn last_os_error(op: &'static str) -> Self {
        let code = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::SocketOperationFailed { op, code }
    }

    /// Builds a `SocketOperationFailed` from an `io::Error`.
    pub fn from_io(op: &'static str, err: &io::Error) -> Self {
        Self::SocketOperationFailed {
            op,
            code: err.raw_os_error().unwrap_or(0),
        }
    }

    /// True for the two reasons that end a connection without a failure.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::SocketDisconnected | Self::Disposed)
    }
}

struct OsCode(i32);

impl fmt::Display for OsCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", io::Error::from_raw_os_error(self.0), self.0)
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
