//! Error taxonomy shared by the watermarking core.
//!
//! Recoverable conditions carry a kind the worker can translate into a job
//! failure message; `Internal` collects I/O and library errors on their way
//! to the operator log.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Payload length, CRC, or version field outside tolerance.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// File extension not in the known media set.
    #[error("unsupported media type: {0}")]
    UnsupportedMedia(String),

    /// Trimmed dimensions or block count below the embedding threshold.
    #[error("image too small: {0}")]
    ImageTooSmall(String),

    /// The image parser rejected the input bytes.
    #[error("failed to decode input: {0}")]
    DecodeFailed(String),

    /// Non-zero exit (or unparsable output) from the external tool.
    #[error("external tool failed: {0}")]
    ExternalToolFailed(String),

    /// Lost a race on a queue row; the caller returns to the claim loop.
    #[error("store conflict: {0}")]
    StoreConflict(String),

    /// Root shutdown observed mid-operation.
    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Internal(format!("sqlite: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("json: {e}"))
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::DecodeFailed(e.to_string())
    }
}
