//! Error types for strand-storage
//!
//! This module defines the error types used throughout the storage crate.

use strand_core::LogError;
use thiserror::Error;

/// Errors that can occur in storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error during storage operations
    #[error("I/O error: {0}")]
    Io(String),

    /// Backend (database) error
    #[error("Database error: {0}")]
    Database(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Error raised by a log or query
    #[error(transparent)]
    Log(#[from] LogError),

    /// A subset query argument failed to evaluate
    #[error("subset {op} argument #{position} failed: {source}")]
    Subset {
        op: &'static str,
        position: usize,
        #[source]
        source: Box<StorageError>,
    },

    /// A subset query was rejected before evaluation
    #[error("Invalid subset query: {0}")]
    InvalidSubset(String),

    /// Background flushing failed too often; writes are refused
    #[error("Writes suspended after {failures} consecutive flush failures")]
    CircuitOpen { failures: u32 },

    /// The index, multilog or backend has been closed
    #[error("Storage has been closed")]
    Closed,
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl StorageError {
    /// Create a new Database error
    pub fn database(message: impl std::fmt::Display) -> Self {
        Self::Database(message.to_string())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }

    /// Create a new InvalidSubset error
    pub fn invalid_subset(message: impl Into<String>) -> Self {
        Self::InvalidSubset(message.into())
    }

    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// The underlying log error, if any
    pub fn as_log_error(&self) -> Option<&LogError> {
        match self {
            Self::Log(err) => Some(err),
            _ => None,
        }
    }
}
