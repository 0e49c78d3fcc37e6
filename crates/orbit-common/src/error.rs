//! Error types for the orbit satellite core.
//!
//! One shared error enum covers both subsystems; the variants map onto the
//! failure kinds callers are expected to branch on.

use thiserror::Error;

/// Common result type for orbit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for orbit
#[derive(Debug, Error)]
pub enum Error {
    // Request validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Uniqueness violations (duplicate version, duplicate segment)
    #[error("conflict: {0}")]
    Conflict(String),

    // Addressed row absent or in the wrong state for the operation
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("segment not found: {0}")]
    SegmentNotFound(String),

    // Queue errors
    #[error("empty audit queue")]
    EmptyQueue,

    #[error("pending queue already in progress")]
    QueueInProgress,

    // Cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    // Network/RPC errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    // Backing store errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Internal errors (bug-class)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an object not found error
    pub fn object_not_found(msg: impl Into<String>) -> Self {
        Self::ObjectNotFound(msg.into())
    }

    /// Create a segment not found error
    pub fn segment_not_found(msg: impl Into<String>) -> Self {
        Self::SegmentNotFound(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_) | Self::SegmentNotFound(_))
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionFailed(_))
    }

    /// Check if this error came from a cancellation token
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// redb reports distinct error types per phase; they all collapse into the
// storage kind because callers only branch on the spec-level kinds above.

impl From<redb::DatabaseError> for Error {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(err: redb::TransactionError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(err: redb::TableError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(err: redb::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(err: redb::CommitError) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::object_not_found("missing").is_not_found());
        assert!(Error::segment_not_found("missing").is_not_found());
        assert!(!Error::conflict("duplicate").is_not_found());
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::ConnectionFailed("refused".into()).is_retryable());
        assert!(!Error::invalid_request("bad").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_cancelled() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Timeout.is_cancelled());
    }
}
