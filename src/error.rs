//! Error types for tacoglow-rs.

use std::path::PathBuf;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Checkpoint file is absent or not a regular file.
    #[error("checkpoint {} not found", .0.display())]
    NotFound(PathBuf),

    /// Checkpoint could not be read as a parameter bundle.
    #[error("invalid checkpoint format in {}: {reason}", .path.display())]
    InvalidFormat { path: PathBuf, reason: String },

    /// Parameter names or shapes don't match the target model.
    #[error("incompatible checkpoint: {0}")]
    IncompatibleCheckpoint(String),

    /// Invalid or incomplete configuration.
    #[error("config: {0}")]
    Config(String),

    /// Candle tensor/device failure during a forward pass.
    #[error("runtime: {0}")]
    Runtime(#[from] candle_core::Error),

    /// Text normalization error.
    #[error("text: {0}")]
    Text(String),

    /// Audio processing error (STFT, WAV I/O).
    #[error("audio: {0}")]
    Audio(String),

    /// External training launcher failure.
    #[error("training: {0}")]
    Training(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}
