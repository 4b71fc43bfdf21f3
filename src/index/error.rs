//! Index store error types
//!
//! Defines all errors that can occur while loading, mutating or persisting
//! an index.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the index store
#[derive(Error, Debug)]
pub enum IndexError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The index file exists but could not be parsed
    #[error("Corrupt index {path:?}: {reason}")]
    Corruption { path: PathBuf, reason: String },

    /// The index was written by a newer version of the tool
    #[error("Unsupported index version {found} (max supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Writing the index to disk failed
    #[error("Failed to write index {path:?}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexError::Corruption {
            path: PathBuf::from("snapshots/index.json"),
            reason: "expected value at line 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Corrupt index \"snapshots/index.json\": expected value at line 1"
        );

        let err = IndexError::UnsupportedVersion {
            found: 9,
            supported: 1,
        };
        assert_eq!(
            err.to_string(),
            "Unsupported index version 9 (max supported: 1)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let index_err: IndexError = io_err.into();
        assert!(matches!(index_err, IndexError::Io(_)));
    }
}
