//! Error taxonomy shared by the codec, the connector and the table caches.
use std::io;

use thiserror::Error;

use crate::protocol::{CommandId, RemoteErrorKind};

/// List of possible errors surfaced by the client runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Malformed frame, unexpected status byte or a streamed row count mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport failure while acquiring, writing or reading.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// Authentication or authorization failure; never retried.
    #[error("immediate failure: {0}")]
    ImmediateFail(String),

    /// A lookup that must resolve found nothing.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid expression '{path}': {reason}")]
    InvalidExpression { path: String, reason: String },

    /// Error reported by the master server.
    #[error("[remote error][{kind:?}]: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The connector owning a table has been dropped.
    #[error("connector closed")]
    Closed,

    /// Final outcome of a retryable call.
    #[error("command {command} failed after {attempts} attempt(s), last status {last_status:?}: {source}")]
    Request {
        command: CommandId,
        attempts: usize,
        last_status: Option<u8>,
        source: Box<ClientError>,
    },
}

impl ClientError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ClientError::Protocol(msg.into())
    }

    /// Innermost error, looking through any [`ClientError::Request`] context.
    pub fn cause(&self) -> &ClientError {
        match self {
            ClientError::Request { source, .. } => source.cause(),
            e => e,
        }
    }

    /// Whether a failed attempt may be tried again under the retry policy.
    ///
    /// A [`ClientError::Request`] has already been through its own retry loop and is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Protocol(_) | ClientError::Connection(_) | ClientError::Remote { .. } => {
                true
            }
            ClientError::ImmediateFail(_)
            | ClientError::DataIntegrity(_)
            | ClientError::Cancelled
            | ClientError::Unsupported(_)
            | ClientError::InvalidExpression { .. }
            | ClientError::Config(_)
            | ClientError::Closed
            | ClientError::Request { .. } => false,
        }
    }
}

/// Maps a raw I/O failure, turning a truncated stream into a protocol error.
pub(crate) fn from_io(err: io::Error) -> ClientError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ClientError::Protocol(format!("truncated stream: {err}"))
    } else {
        ClientError::Connection(err)
    }
}
