use thiserror::Error;

use crate::dispatch::QueueError;
use crate::progress::StoreError;
use crate::reader::ReaderError;

/// Result type used throughout the export pipeline.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Request validation failures. Raised before any estimation or I/O.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid format specified: {value}")]
    UnknownFormat { value: String },

    #[error("Only JSON format is supported for streaming exports")]
    StreamingFormat { value: String },

    #[error("Invalid dataset specified: {value}")]
    UnknownDataset { value: String },

    #[error("Invalid limit: {value} (expected a positive integer)")]
    InvalidLimit { value: String },

    #[error("Unsupported filter '{key}' for dataset {dataset}")]
    UnsupportedFilter { key: String, dataset: String },
}

/// Coarse classification of export failures.
///
/// The export core never picks transport status codes; callers map a kind to
/// whatever their protocol needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    SizeLimit,
    Conflict,
    DataSource,
    Queue,
    Storage,
    Internal,
}

/// Errors produced by the export pipeline.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(
        "Estimated export size {estimated_size_mb:.2} MB exceeds the maximum of {max_size_mb:.2} MB"
    )]
    SizeLimitExceeded {
        estimated_size_mb: f64,
        max_size_mb: f64,
    },

    #[error("Export of ~{estimated_records} records requires asynchronous processing")]
    RequiresAsync {
        estimated_records: u64,
        estimated_size_mb: f64,
    },

    #[error(transparent)]
    DataSource(#[from] ReaderError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Output write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding {format} output failed: {message}")]
    Encode {
        format: &'static str,
        message: String,
    },
}

impl ExportError {
    pub fn encode(format: &'static str, message: impl Into<String>) -> Self {
        Self::Encode {
            format,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExportError::Validation(_) => ErrorKind::Validation,
            ExportError::SizeLimitExceeded { .. } => ErrorKind::SizeLimit,
            ExportError::RequiresAsync { .. } => ErrorKind::Conflict,
            ExportError::DataSource(_) => ErrorKind::DataSource,
            ExportError::Queue(_) => ErrorKind::Queue,
            ExportError::Storage(_) => ErrorKind::Storage,
            ExportError::Io(_) | ExportError::Encode { .. } => ErrorKind::Internal,
        }
    }

    /// Whether a client may retry the same request unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DataSource | ErrorKind::Queue | ErrorKind::Storage
        )
    }

    /// True when the sink went away underneath a streaming write.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ExportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_retry_policy() {
        let validation: ExportError = ValidationError::UnknownDataset {
            value: "invalid".into(),
        }
        .into();
        assert_eq!(validation.kind(), ErrorKind::Validation);
        assert!(!validation.is_retriable());

        let size = ExportError::SizeLimitExceeded {
            estimated_size_mb: 600.0,
            max_size_mb: 500.0,
        };
        assert_eq!(size.kind(), ErrorKind::SizeLimit);
        assert!(!size.is_retriable());
        assert!(size.to_string().contains("600.00 MB"));

        let source: ExportError = ReaderError::Unavailable("connection refused".into()).into();
        assert_eq!(source.kind(), ErrorKind::DataSource);
        assert!(source.is_retriable());

        let queue: ExportError = QueueError::Unavailable("queue full".into()).into();
        assert_eq!(queue.kind(), ErrorKind::Queue);
        assert!(queue.is_retriable());
    }

    #[test]
    fn broken_pipe_is_a_disconnect() {
        let err: ExportError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(err.is_disconnect());
        assert_eq!(err.kind(), ErrorKind::Internal);

        let other: ExportError = std::io::Error::other("disk full").into();
        assert!(!other.is_disconnect());
    }
}
