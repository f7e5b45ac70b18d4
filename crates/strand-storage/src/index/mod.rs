//! Secondary indexes over a log
//!
//! An index maps [`Addr`] keys to values and hands readers an observable per
//! key, so they learn about later `set`/`delete` calls. Indexes are fed by a
//! [`SinkIndex`] that consumes a seq-wrapped query over the source log and
//! records how far it got, which makes processing resumable after a crash.
//!
//! ```text
//! Log ──query(Gt(seq), SeqWrap)──► SinkIndex ──proc(seq, value, setter)──►
//!                                      │          SetterIndex / MultiLog
//!                                      └── set_seq(seq) after each entry
//! ```

mod cache;
mod kv;
mod mem;
mod sink;

pub use cache::ObservableCache;
pub use kv::KvIndex;
pub use mem::MemIndex;
pub use sink::{SinkIndex, SinkState, StreamProcFn};

use strand_core::{Addr, ReadOnlyObservable, Seq};

use crate::error::StorageError;

/// The value of one index key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue<T> {
    /// The key holds a value
    Set(T),
    /// The key holds nothing (never set or deleted)
    Unset(Addr),
}

impl<T> IndexValue<T> {
    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set(_))
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Self::Set(v) => Some(v),
            Self::Unset(_) => None,
        }
    }

    pub fn into_set(self) -> Option<T> {
        match self {
            Self::Set(v) => Some(v),
            Self::Unset(_) => None,
        }
    }
}

/// Read side of an index
pub trait Index<T>: Send + Sync {
    /// Observable for `addr`
    ///
    /// A key that was never set yields `IndexValue::Unset`, not an error.
    fn get(&self, addr: &Addr) -> Result<ReadOnlyObservable<IndexValue<T>>, StorageError>;
}

/// An index that can be written
pub trait SetterIndex<T>: Index<T> {
    /// Store `value` under `addr` and notify live readers
    fn set(&self, addr: Addr, value: T) -> Result<(), StorageError>;

    /// Remove `addr` and publish `Unset` to live readers
    fn delete(&self, addr: &Addr) -> Result<(), StorageError>;

    /// Make every preceding write durable
    fn flush(&self) -> Result<(), StorageError>;

    /// Flush and release resources
    fn close(&self) -> Result<(), StorageError>;
}

/// Tracks the last log seq an owner has durably processed
///
/// `set_seq` is called once per processed entry; the position becomes
/// durable together with the writes made for that entry.
pub trait SeqTracker: Send + Sync {
    /// Resume position, `SEQ_EMPTY` when nothing was processed yet
    fn get_seq(&self) -> Result<Seq, StorageError>;

    fn set_seq(&self, seq: Seq) -> Result<(), StorageError>;
}

/// A writable index with a resume position
pub trait SeqSetterIndex<T>: SetterIndex<T> + SeqTracker {}

impl<T, I> SeqSetterIndex<T> for I where I: SetterIndex<T> + SeqTracker + ?Sized {}
