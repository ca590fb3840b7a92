//! Crate-wide error types and the transient/permanent error taxonomy.

use thiserror::Error;

/// Library-wide infrastructure error.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("event log error: {0}")]
    EventLog(#[from] rusqlite::Error),

    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Error taxonomy for file-level operations (spec §7).
///
/// Every error that can surface from [`crate::fileops`] or [`crate::hash`]
/// is classified into one of these at the `DestinationQueue` boundary so
/// `RetryPolicy` can decide what to do with it.
#[derive(Error, Debug, Clone)]
pub enum FileOpError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("path escapes allowed root: {0}")]
    PathEscape(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("destination out of space: {0}")]
    NoSpace(String),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("network volume unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("temporary permission issue: {0}")]
    TemporaryPermission(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Whether an error is safe to retry, fatal to a single file, or a
/// cooperative-cancellation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Cancelled,
}

impl FileOpError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            FileOpError::Cancelled => ErrorClass::Cancelled,
            FileOpError::Timeout(_)
            | FileOpError::NetworkUnavailable(_)
            | FileOpError::DeviceBusy(_)
            | FileOpError::TemporaryPermission(_) => ErrorClass::Transient,
            FileOpError::PathEscape(_)
            | FileOpError::PermissionDenied(_)
            | FileOpError::InvalidSource(_)
            | FileOpError::NoSpace(_)
            | FileOpError::ChecksumMismatch { .. }
            | FileOpError::Internal(_) => ErrorClass::Permanent,
        }
    }

    /// A short machine-stable identifier used in event logs and CSVs.
    pub fn kind_str(&self) -> &'static str {
        match self {
            FileOpError::Cancelled => "Cancelled",
            FileOpError::PathEscape(_) => "PathEscape",
            FileOpError::PermissionDenied(_) => "PermissionDenied",
            FileOpError::InvalidSource(_) => "InvalidSource",
            FileOpError::NoSpace(_) => "NoSpace",
            FileOpError::ChecksumMismatch { .. } => "ChecksumMismatch",
            FileOpError::Timeout(_) => "Timeout",
            FileOpError::NetworkUnavailable(_) => "NetworkUnavailable",
            FileOpError::DeviceBusy(_) => "DeviceBusy",
            FileOpError::TemporaryPermission(_) => "TemporaryPermission",
            FileOpError::Internal(_) => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_classify_transient() {
        assert_eq!(
            FileOpError::Timeout(std::time::Duration::from_secs(30)).classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            FileOpError::NetworkUnavailable("smb".into()).classify(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn permanent_errors_classify_permanent() {
        assert_eq!(
            FileOpError::PathEscape("../x".into()).classify(),
            ErrorClass::Permanent
        );
        assert_eq!(
            FileOpError::ChecksumMismatch {
                path: "a.jpg".into(),
                expected: "aa".into(),
                actual: "bb".into()
            }
            .classify(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn cancelled_classifies_cancelled() {
        assert_eq!(FileOpError::Cancelled.classify(), ErrorClass::Cancelled);
    }
}
