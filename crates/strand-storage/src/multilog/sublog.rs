//! One key of a multilog

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use roaring::RoaringTreemap;
use strand_core::{Addr, LogError, ReadOnlySequence, Seq, SequenceObservable};

use crate::log::{Log, Query, QuerySpec, check_bounds};

struct SublogState {
    bitmap: RoaringTreemap,
    dirty: bool,
    deleted: bool,
}

/// The set of log seqs associated with one [`Addr`]
///
/// Viewed as a log, entry `i` is the `i`-th smallest member, so members are
/// expected to be added in increasing order (as a sink index does). The
/// tail counter advances only when a new member is added.
pub struct Sublog {
    addr: Addr,
    state: Mutex<SublogState>,
    seq: SequenceObservable,
}

impl Sublog {
    pub(crate) fn new(addr: Addr, bitmap: RoaringTreemap) -> Self {
        let count = bitmap.len();
        Self {
            addr,
            state: Mutex::new(SublogState {
                bitmap,
                dirty: false,
                deleted: false,
            }),
            seq: SequenceObservable::new(count),
        }
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }

    /// Add `seq` as a member; returns false if it already was one
    ///
    /// Members only change the in-memory bitmap. They reach the backend with
    /// the owning multilog's next flush, so a tripped writer refuses the
    /// multilog's `set_seq` rather than this call.
    pub fn add(&self, seq: Seq) -> Result<bool, LogError> {
        if seq < 0 {
            return Err(LogError::OutOfBounds { seq });
        }

        let mut state = self.state.lock();
        if state.deleted {
            return Err(LogError::SublogDeleted);
        }
        let inserted = state.bitmap.insert(seq as u64);
        if inserted {
            state.dirty = true;
            self.seq.inc();
        }
        Ok(inserted)
    }

    pub fn contains(&self, seq: Seq) -> bool {
        seq >= 0 && self.state.lock().bitmap.contains(seq as u64)
    }

    /// Number of members
    pub fn len(&self) -> u64 {
        self.state.lock().bitmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().bitmap.is_empty()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Copy of the member set
    pub fn bitmap(&self) -> RoaringTreemap {
        self.state.lock().bitmap.clone()
    }

    /// Snapshot of the members if they changed since the last call
    pub(crate) fn take_dirty(&self) -> Option<RoaringTreemap> {
        let mut state = self.state.lock();
        if !state.dirty || state.deleted {
            return None;
        }
        state.dirty = false;
        Some(state.bitmap.clone())
    }

    /// Put a snapshot back after a failed write
    pub(crate) fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    pub(crate) fn mark_deleted(&self) {
        let mut state = self.state.lock();
        state.deleted = true;
        state.dirty = false;
    }
}

#[async_trait]
impl Log<Seq> for Sublog {
    async fn append(&self, value: Seq) -> Result<Seq, LogError> {
        self.add(value)?;
        Ok(self.seq.value() as Seq - 1)
    }

    async fn get(&self, seq: Seq) -> Result<Seq, LogError> {
        let state = self.state.lock();
        if state.deleted {
            return Err(LogError::SublogDeleted);
        }
        let len = usize::try_from(state.bitmap.len()).unwrap_or(usize::MAX);
        let idx = check_bounds(seq, len)?;
        state
            .bitmap
            .select(idx as u64)
            .map(|member| member as Seq)
            .ok_or(LogError::OutOfBounds { seq })
    }

    fn seq(&self) -> ReadOnlySequence {
        self.seq.read_only()
    }

    fn query(self: Arc<Self>, specs: &[QuerySpec]) -> Result<Query<Seq>, LogError> {
        Query::new(self, specs)
    }
}

impl std::fmt::Debug for Sublog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sublog")
            .field("addr", &self.addr)
            .field("len", &self.len())
            .finish()
    }
}
