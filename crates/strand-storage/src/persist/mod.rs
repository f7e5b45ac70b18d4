//! Batched persistence layer
//!
//! Indexes and multilogs persist through a transactional key/value
//! [`KvBackend`]. Writes are buffered by a [`BatchWriter`] and committed in
//! a single transaction together with the owner's resume position, so stored
//! data and the recorded seq can never drift apart by more than one batch.
//!
//! ```text
//! set(addr, v) ─► BatchWriter.ops ──(full-check tick / flush-all tick /
//!                                     hard limit / explicit flush)──►
//!                 KvBackend::write_batch([seq marker, op, op, ...])
//! ```
//!
//! A backend may be shared by several owners, each writing under its own key
//! prefix. Shared backends are closed by whoever created them.

mod batch;
mod memory;
mod redb_backend;
mod task;

pub use batch::{BatchConfig, BatchWriter, CURRENT_SEQ_KEY};
pub use memory::MemoryBackend;
pub use redb_backend::{RedbBackend, RedbBackendConfig};
pub use task::{FlushTick, spawn_flush_task};

use crate::error::StorageError;

/// Type alias for scan results to simplify complex type
pub type ScanResults = Vec<(Vec<u8>, Vec<u8>)>;

/// One buffered write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Store `value` under `key`
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove `key`
    Delete { key: Vec<u8> },
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// A transactional key/value store
///
/// `write_batch` must apply all operations atomically and in order: either
/// every operation is durable afterwards or none is.
pub trait KvBackend: Send + Sync {
    /// Read a single key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Apply a batch of operations in one transaction
    fn write_batch(&self, ops: &[BatchOp]) -> Result<(), StorageError>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<ScanResults, StorageError>;

    /// Release the backend; later calls fail with `Closed`
    fn close(&self) -> Result<(), StorageError>;
}
