//! Error types for Sealdrop.

use thiserror::Error;

/// Common error type for Sealdrop.
///
/// Operation-level failures that callers are expected to branch on
/// (`UploadError`, `DownloadError`) live next to the transfer service; this
/// type covers the infrastructure underneath them.
#[derive(Error, Debug)]
pub enum SealdropError {
    /// Database error.
    ///
    /// Errors from sqlx are converted into this variant.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation error for caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Deletion scheduling error.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

// Conversion from sqlx errors
impl From<sqlx::Error> for SealdropError {
    fn from(e: sqlx::Error) -> Self {
        SealdropError::Database(e.to_string())
    }
}

/// Result type alias for Sealdrop operations.
pub type Result<T> = std::result::Result<T, SealdropError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = SealdropError::Validation("subject too long".to_string());
        assert_eq!(err.to_string(), "validation error: subject too long");
    }

    #[test]
    fn test_not_found_error_display() {
        let err = SealdropError::NotFound("transfer".to_string());
        assert_eq!(err.to_string(), "transfer not found");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "blob missing");
        let err: SealdropError = io_err.into();
        assert!(matches!(err, SealdropError::Io(_)));
        assert!(err.to_string().contains("blob missing"));
    }

    #[test]
    fn test_sqlx_error_conversion() {
        let err: SealdropError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, SealdropError::Database(_)));
    }

    #[test]
    fn test_result_alias() {
        fn sample_ok() -> Result<i32> {
            Ok(42)
        }

        fn sample_err() -> Result<i32> {
            Err(SealdropError::Scheduler("queue unavailable".to_string()))
        }

        assert_eq!(sample_ok().unwrap(), 42);
        assert!(sample_err().is_err());
    }
}
