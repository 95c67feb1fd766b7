use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

/// Unified error type for stream composition and backing-store operations.
///
/// Short reads at end of media are never reported through this type; they surface as a byte
/// count below the requested length. Only genuine faults and contract violations end up here.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid alignment {alignment} (expected a non-zero power of two)")]
    InvalidAlignment { alignment: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("out of range: offset={offset} len={len} length={length}")]
    OutOfRange { offset: u64, len: u64, length: u64 },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("attempt to seek before beginning of stream")]
    NegativeSeek,

    #[error("attempt to write beyond end of stream: position={position} len={len} length={length}")]
    WriteBeyondEnd { position: u64, len: u64, length: u64 },

    #[error("stream is read-only")]
    ReadOnly,

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    /// Convert into a `std::io::Error`, choosing the closest [`io::ErrorKind`].
    ///
    /// The original error is kept as the inner error so callers can downcast it back.
    pub fn into_io_error(self) -> io::Error {
        match self {
            StreamError::Io(err) => err,
            err @ (StreamError::InvalidAlignment { .. }
            | StreamError::InvalidConfig(_)
            | StreamError::OffsetOverflow
            | StreamError::NegativeSeek) => io::Error::new(io::ErrorKind::InvalidInput, err),
            err @ (StreamError::OutOfRange { .. } | StreamError::WriteBeyondEnd { .. }) => {
                io::Error::new(io::ErrorKind::UnexpectedEof, err)
            }
            err @ StreamError::ReadOnly => io::Error::new(io::ErrorKind::PermissionDenied, err),
            err @ StreamError::NotSupported(_) => io::Error::new(io::ErrorKind::Unsupported, err),
        }
    }
}
