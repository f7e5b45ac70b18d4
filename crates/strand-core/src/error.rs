//! Error types for Strand logs
//!
//! [`LogError`] is shared by every log implementation and by the query
//! engine. Storage-level failures are wrapped by `strand-storage`.

use thiserror::Error;

use crate::seq::Seq;

/// Errors returned by logs, queries and observables
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogError {
    /// The sequence number does not name an entry of the log
    #[error("seq {seq} is out of bounds")]
    OutOfBounds { seq: Seq },

    /// The entry exists but has been nulled (redacted)
    #[error("entry at seq {seq} has been nulled")]
    Nulled { seq: Seq },

    /// Attempt to mutate a read-only view
    #[error("read-only: {0}")]
    ReadOnly(&'static str),

    /// Encoding or decoding a value failed
    #[error("codec error: {0}")]
    Codec(String),

    /// The query constraints cannot be satisfied
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The consumer cancelled a blocking operation
    #[error("operation cancelled")]
    Cancelled,

    /// I/O failure in a file-backed log
    #[error("I/O error: {0}")]
    Io(String),

    /// The sublog has been deleted from its multilog
    #[error("sublog has been deleted")]
    SublogDeleted,
}

impl LogError {
    /// Create a new Codec error
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Create a new InvalidQuery error
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery(message.into())
    }

    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// True if the error marks a nulled entry rather than a failure
    pub fn is_nulled(&self) -> bool {
        matches!(self, Self::Nulled { .. })
    }
}

impl From<std::io::Error> for LogError {
    fn from(err: std::io::Error) -> Self {
        LogError::Io(err.to_string())
    }
}
