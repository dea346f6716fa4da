//! Error types for gridfs-stream.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Open,
    Read,
    Write,
    Seek,
    Close,
    Exists,
    Unlink,
    List,
    Shutdown,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Open => "open",
            Self::Read => "read",
            Self::Write => "write",
            Self::Seek => "seek",
            Self::Close => "close",
            Self::Exists => "exists",
            Self::Unlink => "unlink",
            Self::List => "list",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Errors reported by the store and its streams.
///
/// Cloneable so that one outcome can be handed to every caller waiting on a
/// shared connection or file handle.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The connection configuration cannot be used at all.
    #[error("invalid database config: {0}")]
    InvalidConfig(String),

    /// A pre-built handle that no registered backend recognises.
    #[error("unknown database config: no backend accepts a {0}")]
    UnknownConfig(String),

    /// The connection was established but no backend can drive it.
    #[error("could not locate a gridfs backend for connection of type {0}")]
    BackendNotFound(String),

    /// Byte range with `start > end`.
    #[error("start must be <= end (start: {start}, end: {end})")]
    InvalidRange { start: u64, end: u64 },

    /// Text that is not valid in the requested encoding.
    #[error("invalid {encoding} text: {message}")]
    Encoding {
        encoding: &'static str,
        message: String,
    },

    /// The underlying store failed.
    #[error("{op} failed: {cause:#}")]
    Io {
        op: Operation,
        cause: Arc<anyhow::Error>,
    },

    /// An operation did not finish within the configured limit.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: Operation, after: Duration },

    /// Error reported by the transport outside of any call.
    #[error("connection error: {0:#}")]
    Connection(Arc<anyhow::Error>),

    /// The stream was already destroyed.
    #[error("stream destroyed")]
    Destroyed,

    /// A lazy open ended without producing a result.
    #[error("lazy initialization was abandoned before it completed")]
    Abandoned,
}

impl Error {
    pub(crate) fn io(op: Operation, cause: anyhow::Error) -> Self {
        Self::Io {
            op,
            cause: Arc::new(cause),
        }
    }

    /// Configuration problems: fatal to the store, the caller must rebuild it.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::UnknownConfig(_) | Self::BackendNotFound(_)
        )
    }

    /// The failing operation, for I/O errors and timeouts.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Io { op, .. } | Self::Timeout { op, .. } => Some(*op),
            _ => None,
        }
    }
}

impl From<deferred::Abandoned> for Error {
    fn from(_: deferred::Abandoned) -> Self {
        Self::Abandoned
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::InvalidRange { .. } => std::io::ErrorKind::InvalidInput,
            Error::Encoding { .. } => std::io::ErrorKind::InvalidData,
            Error::Timeout { .. } => std::io::ErrorKind::TimedOut,
            Error::Destroyed => std::io::ErrorKind::BrokenPipe,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Run one store operation, bounding it by `limit` when set.
pub(crate) async fn timed<T, F>(op: Operation, limit: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = anyhow::Result<T>>,
{
    let outcome = match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| Error::Timeout { op, after })?,
        None => fut.await,
    };
    outcome.map_err(|cause| Error::io(op, cause))
}
