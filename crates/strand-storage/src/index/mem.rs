//! In-memory index

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use strand_core::{Addr, ReadOnlyObservable, SEQ_EMPTY, Seq};

use super::{Index, IndexValue, ObservableCache, SeqTracker, SetterIndex};
use crate::error::StorageError;

/// Index kept in a hash map; nothing survives a restart
pub struct MemIndex<T> {
    data: Mutex<HashMap<Addr, T>>,
    /// Bumped under the `data` lock by every write
    version: AtomicU64,
    seq: Mutex<Seq>,
    cache: ObservableCache<T>,
    closed: AtomicBool,
}

impl<T> MemIndex<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            version: AtomicU64::new(0),
            seq: Mutex::new(SEQ_EMPTY),
            cache: ObservableCache::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl<T> Default for MemIndex<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<T> for MemIndex<T>
where
    T: Clone + Send + 'static,
{
    fn get(&self, addr: &Addr) -> Result<ReadOnlyObservable<IndexValue<T>>, StorageError> {
        self.check_open()?;
        self.cache.get_or_load(addr, || {
            let data = self.data.lock();
            let value = match data.get(addr) {
                Some(v) => IndexValue::Set(v.clone()),
                None => IndexValue::Unset(addr.clone()),
            };
            Ok((value, self.version.load(Ordering::SeqCst)))
        })
    }
}

impl<T> SetterIndex<T> for MemIndex<T>
where
    T: Clone + Send + 'static,
{
    fn set(&self, addr: Addr, value: T) -> Result<(), StorageError> {
        self.check_open()?;
        let version = {
            let mut data = self.data.lock();
            data.insert(addr.clone(), value.clone());
            self.version.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.cache.publish(&addr, IndexValue::Set(value), version);
        Ok(())
    }

    fn delete(&self, addr: &Addr) -> Result<(), StorageError> {
        self.check_open()?;
        let version = {
            let mut data = self.data.lock();
            data.remove(addr);
            self.version.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.cache.publish(addr, IndexValue::Unset(addr.clone()), version);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        self.cache.clear();
        Ok(())
    }
}

impl<T> SeqTracker for MemIndex<T>
where
    T: Clone + Send + 'static,
{
    fn get_seq(&self) -> Result<Seq, StorageError> {
        Ok(*self.seq.lock())
    }

    fn set_seq(&self, seq: Seq) -> Result<(), StorageError> {
        *self.seq.lock() = seq;
        Ok(())
    }
}
