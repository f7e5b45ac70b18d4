//! # Strand Storage
//!
//! The append-only log and secondary-index engine of Strand.
//!
//! Producers append values to a [`Log`]; indexes follow the log through a
//! [`SinkIndex`] and keep their own resume position; consumers read indexes,
//! multilogs (optionally through the [`SubsetPlanner`]) or the log directly.
//!
//! ## Features
//!
//! - **Log**: [`MemLog`], file-backed [`OffsetLog`] and the read-only
//!   [`IndirectLog`], all queryable through [`Query`]
//! - **Indexes**: [`MemIndex`] and the batched [`KvIndex`], with per-key
//!   observables evicted once nobody listens
//! - **Persistence**: [`KvBackend`] over redb or memory, buffered by a
//!   [`BatchWriter`] that commits data and resume position together
//! - **MultiLog**: [`RoaringMultiLog`], one roaring bitmap of seqs per key
//! - **Subset queries**: `and`/`or` trees of author and type filters
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strand_storage::{Log, MemLog, gt, live, seq_wrap};
//!
//! #[tokio::main]
//! async fn main() {
//!     let log = Arc::new(MemLog::new());
//!     log.append("hello".to_string()).await.unwrap();
//!
//!     let mut query = log.clone().query(&[gt(-1), live(true), seq_wrap(true)]).unwrap();
//!     while let Some(item) = query.next().await {
//!         println!("{:?}", item.unwrap());
//!     }
//! }
//! ```

pub mod error;
pub mod index;
pub mod log;
pub mod multilog;
pub mod persist;
pub mod subset;

// Re-exports
pub use error::StorageError;
pub use index::{
    Index, IndexValue, KvIndex, MemIndex, ObservableCache, SeqSetterIndex, SeqTracker,
    SetterIndex, SinkIndex, SinkState, StreamProcFn,
};
pub use log::{
    IndirectLog, Log, MemLog, OffsetLog, OffsetLogConfig, Query, QueryItem, QuerySpec, gt, gte,
    limit, live, lt, lte, reverse, seq_wrap,
};
pub use multilog::{MultiLog, MultiLogConfig, RoaringMultiLog, Sublog};
pub use persist::{
    BatchConfig, BatchOp, BatchWriter, CURRENT_SEQ_KEY, KvBackend, MemoryBackend, RedbBackend,
    RedbBackendConfig,
};
pub use subset::{SubsetLimits, SubsetOperation, SubsetOptions, SubsetPlanner};

// Re-export the leaf types for convenience
pub use strand_core::{Addr, LogError, SEQ_EMPTY, SEQ_ERRORED, Seq, SeqWrapper};
