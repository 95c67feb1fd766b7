use std::io;

use devio_protocol::DecodeError;
use devio_storage::StreamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("transport identity {0:?} is already in use")]
    InUse(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StreamError),

    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("declared transfer length {length} exceeds maximum transfer size {max}")]
    ProtocolViolation { length: u64, max: u64 },

    #[error("timed out")]
    Timeout,

    #[error("server was stopped")]
    Stopped,

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("remote request failed: {0}")]
    Remote(String),
}

impl ServerError {
    /// Whether this error ends the server itself rather than a single request.
    ///
    /// Request-level storage failures are answered with an error response and never reach the
    /// caller of [`crate::Server::run`]; everything classified here does.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::InUse(_)
                | ServerError::Bind { .. }
                | ServerError::Io(_)
                | ServerError::Timeout
                | ServerError::Stopped
        )
    }

    /// Whether the client broke the protocol contract.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ServerError::ProtocolViolation { .. } | ServerError::Decode(_)
        )
    }

    pub(crate) fn into_stream_error(self) -> StreamError {
        match self {
            ServerError::Storage(err) => err,
            ServerError::Io(err) => StreamError::Io(err),
            other => StreamError::Io(io::Error::new(io::ErrorKind::Other, other)),
        }
    }
}
