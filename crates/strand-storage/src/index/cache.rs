//! Read cache of per-key observables

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use strand_core::{Addr, Observable, ReadOnlyObservable};

use super::IndexValue;

type Entries<T> = Mutex<HashMap<Addr, Observable<IndexValue<T>>>>;

/// Observables handed out by an index, evicted once their last listener
/// is cancelled
///
/// Eviction only drops the cached observable; the stored value is untouched.
pub struct ObservableCache<T> {
    entries: Arc<Entries<T>>,
}

impl<T> ObservableCache<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cached observable for `addr`, loading the value on a miss
    ///
    /// `load` returns the stored value with the index's write version at the
    /// time it was read.
    pub fn get_or_load<E>(
        &self,
        addr: &Addr,
        load: impl FnOnce() -> Result<(IndexValue<T>, u64), E>,
    ) -> Result<ReadOnlyObservable<IndexValue<T>>, E> {
        let mut entries = self.entries.lock();
        if let Some(obs) = entries.get(addr) {
            return Ok(obs.read_only());
        }

        let (value, version) = load()?;
        let weak = Arc::downgrade(&self.entries);
        let key = addr.clone();
        let obs = Observable::with_cleanup(value, move || evict(&weak, &key)).starting_at(version);
        entries.insert(addr.clone(), obs.clone());
        Ok(obs.read_only())
    }

    /// Push the value written at `version` to the observable for `addr`
    ///
    /// Nothing happens when `addr` is not cached or already holds a later
    /// write, so publishing may race with other writers.
    pub fn publish(&self, addr: &Addr, value: IndexValue<T>, version: u64) {
        let cached = self.entries.lock().get(addr).cloned();
        if let Some(obs) = cached {
            obs.set_newer(version, value);
        }
    }

    pub fn contains(&self, addr: &Addr) -> bool {
        self.entries.lock().contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<T> Default for ObservableCache<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn evict<T>(entries: &Weak<Entries<T>>, addr: &Addr)
where
    T: Clone + Send + 'static,
{
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let mut entries = entries.lock();
    // a reader may have registered again in the meantime
    if entries.get(addr).is_some_and(|obs| obs.listener_count() == 0) {
        entries.remove(addr);
    }
}
