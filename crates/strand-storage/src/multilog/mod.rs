//! Keyed collections of seq sets
//!
//! A [`MultiLog`] maps each [`Addr`] to a [`Sublog`]: the set of log seqs
//! associated with that key, e.g. every message by one author. Sets are
//! roaring bitmaps, persisted as `<prefix><addr>` → serialized bitmap.

mod store;
mod sublog;

pub use store::{MultiLogConfig, RoaringMultiLog};
pub use sublog::Sublog;

use std::sync::Arc;

use roaring::RoaringTreemap;
use strand_core::Addr;

use crate::error::StorageError;

/// A named collection of sublogs
pub trait MultiLog: Send + Sync {
    /// The sublog for `addr`, created empty if it does not exist
    fn get(&self, addr: &Addr) -> Result<Arc<Sublog>, StorageError>;

    /// Every key with at least one member
    fn list(&self) -> Result<Vec<Addr>, StorageError>;

    /// Drop `addr` and its members; open handles start failing
    fn delete(&self, addr: &Addr) -> Result<(), StorageError>;

    /// Snapshot of the members of `addr`, empty if absent
    fn load_bitmap(&self, addr: &Addr) -> Result<RoaringTreemap, StorageError>;

    /// Make every added member durable
    fn flush(&self) -> Result<(), StorageError>;

    /// Flush and release resources
    fn close(&self) -> Result<(), StorageError>;
}
