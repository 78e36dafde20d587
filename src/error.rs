//! Error taxonomy for the receipt pipeline and its collaborators.

use thiserror::Error;

/// Caller input fault: the upload is rejected before any preprocessing or engine work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidImageError {
    #[error("File is empty")]
    EmptyPayload,
    #[error("Unsupported image format: {content_type}")]
    UnsupportedFormat { content_type: String },
    #[error("File too large ({size} bytes, max {max} bytes)")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Image dimensions too large ({width}x{height})")]
    DimensionsTooLarge { width: u32, height: u32 },
    #[error("Invalid or corrupted image: {reason}")]
    CorruptImage { reason: String },
}

/// External engine fault. Detail is for the audit log only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecognitionEngineError {
    #[error("recognition engine unavailable: {0}")]
    Unavailable(String),
    #[error("recognition engine failed: {0}")]
    Engine(String),
    #[error("recognition engine returned an unusable response: {0}")]
    InvalidResponse(String),
    #[error("recognition timed out after {millis}ms")]
    Timeout { millis: u64 },
}

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error(transparent)]
    InvalidImage(#[from] InvalidImageError),
    #[error(transparent)]
    Recognition(#[from] RecognitionEngineError),
}

impl ReceiptError {
    /// Message safe to show to the uploader. Engine internals never leak.
    pub fn caller_message(&self) -> String {
        match self {
            ReceiptError::InvalidImage(InvalidImageError::PayloadTooLarge { max, .. }) => {
                format!("File too large (max {}MB)", max / (1024 * 1024))
            }
            ReceiptError::InvalidImage(InvalidImageError::CorruptImage { .. }) => {
                "Invalid or corrupted image".to_string()
            }
            ReceiptError::InvalidImage(e) => e.to_string(),
            ReceiptError::Recognition(RecognitionEngineError::Timeout { .. }) => {
                "Receipt processing timed out. Try again or enter the transaction manually."
                    .to_string()
            }
            ReceiptError::Recognition(_) => {
                "Receipt processing failed. Try again or enter the transaction manually."
                    .to_string()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not prepare log store location: {0}")]
    Io(#[from] std::io::Error),
    #[error("log store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} not set in .env")]
    Missing(&'static str),
}
