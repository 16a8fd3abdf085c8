use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("truncated read: wanted {wanted} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        wanted: usize,
        available: usize,
    },
    #[error("bit mask exhausted after {consumed} bits")]
    BitMaskExhausted { consumed: usize },

    #[error("bad RLA header: {0}")]
    BadHeader(String),
    #[error("envelope length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("signature mismatch: expected {expected}, got {actual}")]
    BadSignature { expected: u16, actual: u16 },
    #[error("unknown RLA version {0}.{1}")]
    UnknownVersion(u8, u8),

    #[error("curve shape mismatch: {0}")]
    CurveShape(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("HTTP {status} for {url}")]
    HttpError { status: u16, url: String },
    #[error("cipher error: {0}")]
    CipherError(String),

    #[error("cannot seek back to {target}, earliest cached offset is {earliest}")]
    NonSequentialSeek { target: u64, earliest: u64 },
    #[error("download of '{}' failed after {attempts} attempts: {reason}", path.display())]
    DownloaderFailed {
        path: PathBuf,
        attempts: u32,
        reason: String,
    },

    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidData(msg.into())
    }

    /// Whether the error means the input ran out before the value was complete.
    pub fn is_underflow(&self) -> bool {
        matches!(self, Error::Truncated { .. } | Error::BitMaskExhausted { .. })
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(io) => io,
            Error::Truncated { .. } => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, value)
            }
            Error::NotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, value),
            Error::NonSequentialSeek { .. } => {
                std::io::Error::new(std::io::ErrorKind::Unsupported, value)
            }
            other => std::io::Error::other(other),
        }
    }
}
