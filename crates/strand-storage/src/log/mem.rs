//! In-memory log

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use strand_core::{LogError, ReadOnlySequence, Seq, SequenceObservable};

use super::{Log, Query, QuerySpec, check_bounds};

/// A log held entirely in memory; nulled entries are `None`
pub struct MemLog<T> {
    entries: Mutex<Vec<Option<T>>>,
    seq: SequenceObservable,
}

impl<T> MemLog<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            seq: SequenceObservable::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T> Default for MemLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Log<T> for MemLog<T>
where
    T: Clone + Send + 'static,
{
    async fn append(&self, value: T) -> Result<Seq, LogError> {
        let mut entries = self.entries.lock();
        entries.push(Some(value));
        // advance under the lock so tail order matches append order
        self.seq.inc();
        Ok(entries.len() as Seq - 1)
    }

    async fn get(&self, seq: Seq) -> Result<T, LogError> {
        let entries = self.entries.lock();
        let idx = check_bounds(seq, entries.len())?;
        entries[idx].clone().ok_or(LogError::Nulled { seq })
    }

    fn seq(&self) -> ReadOnlySequence {
        self.seq.read_only()
    }

    fn query(self: Arc<Self>, specs: &[QuerySpec]) -> Result<Query<T>, LogError> {
        Query::new(self, specs)
    }

    async fn null(&self, seq: Seq) -> Result<(), LogError> {
        let mut entries = self.entries.lock();
        let idx = check_bounds(seq, entries.len())?;
        entries[idx] = None;
        Ok(())
    }
}
