//! Append-only logs
//!
//! A [`Log`] stores values at consecutive sequence numbers starting at 0 and
//! exposes its tail as a [`ReadOnlySequence`]. Reads go through
//! [`Log::get`] for single entries or [`Log::query`] for lazy, optionally
//! live, iteration.
//!
//! Implementations:
//! - [`MemLog`]: in-memory, for tests and derived views
//! - [`OffsetLog`]: file-backed, length-prefixed frames with nulling
//! - [`IndirectLog`]: read-only view dereferencing a log of seqs against
//!   another log

mod indirect;
mod mem;
mod offset;
mod query;

pub use indirect::IndirectLog;
pub use mem::MemLog;
pub use offset::{OffsetLog, OffsetLogConfig};
pub use query::{Query, QueryItem, QuerySpec, gt, gte, limit, live, lt, lte, reverse, seq_wrap};

use std::sync::Arc;

use async_trait::async_trait;
use strand_core::{LogError, ReadOnlySequence, Seq};

/// An append-only sequential store
///
/// Appends are linearized: the order in which appenders acquire the log's
/// internal lock is the final sequence order, and the tail observable is
/// advanced only once the entry is readable.
#[async_trait]
pub trait Log<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Store `value` at the next sequence number and return it
    async fn append(&self, value: T) -> Result<Seq, LogError>;

    /// Read the value at `seq`
    ///
    /// Fails with `OutOfBounds` for negative or not yet written seqs and
    /// with `Nulled` for tombstoned entries.
    async fn get(&self, seq: Seq) -> Result<T, LogError>;

    /// Read-only view of the tail counter
    fn seq(&self) -> ReadOnlySequence;

    /// Start a lazy query over this log
    fn query(self: Arc<Self>, specs: &[QuerySpec]) -> Result<Query<T>, LogError>;

    /// Tombstone the entry at `seq`
    async fn null(&self, _seq: Seq) -> Result<(), LogError> {
        Err(LogError::ReadOnly("log does not support nulling"))
    }
}

/// Bounds check shared by the log implementations
pub(crate) fn check_bounds(seq: Seq, len: usize) -> Result<usize, LogError> {
    if seq < 0 || seq as u64 >= len as u64 {
        return Err(LogError::OutOfBounds { seq });
    }
    Ok(seq as usize)
}
