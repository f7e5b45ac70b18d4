//! Index persisted through a batched key/value backend

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use strand_core::{Addr, Codec, ReadOnlyObservable, Seq};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{Index, IndexValue, ObservableCache, SeqTracker, SetterIndex};
use crate::error::StorageError;
use crate::persist::{BatchConfig, BatchOp, BatchWriter, KvBackend, spawn_flush_task};

struct KvInner<T, C> {
    writer: Mutex<BatchWriter>,
    codec: C,
    cache: ObservableCache<T>,
    /// Bumped under the writer lock by every write, ordering cache updates
    version: AtomicU64,
    /// Whether closing this index also closes the backend
    owns_backend: bool,
    closed: AtomicBool,
}

/// Durable index with buffered writes
///
/// Values live under `<prefix><addr>`, the resume position under
/// `<prefix>__current_observable`. Writes are buffered and committed by the
/// background flush task, by the hard limit, or by an explicit
/// [`SetterIndex::flush`].
pub struct KvIndex<T, C> {
    inner: Arc<KvInner<T, C>>,
    stop: CancellationToken,
}

impl<T, C> KvIndex<T, C>
where
    T: Clone + Send + 'static,
    C: Codec<T>,
{
    /// Index owning `backend`; closing the index closes the backend
    pub fn new(backend: Arc<dyn KvBackend>, codec: C, config: BatchConfig) -> Self {
        Self::build(backend, Vec::new(), codec, config, true)
    }

    /// Index sharing `backend` with others under `prefix`
    ///
    /// The backend stays open when the index is closed.
    pub fn with_key_prefix(
        backend: Arc<dyn KvBackend>,
        prefix: impl Into<Vec<u8>>,
        codec: C,
        config: BatchConfig,
    ) -> Self {
        Self::build(backend, prefix.into(), codec, config, false)
    }

    #[instrument(skip_all, fields(prefix = %String::from_utf8_lossy(&prefix)))]
    fn build(
        backend: Arc<dyn KvBackend>,
        prefix: Vec<u8>,
        codec: C,
        config: BatchConfig,
        owns_backend: bool,
    ) -> Self {
        let full_check = config.full_check_interval;
        let flush_all = config.flush_all_interval;

        let inner = Arc::new(KvInner {
            writer: Mutex::new(BatchWriter::new(backend, prefix, config)),
            codec,
            cache: ObservableCache::new(),
            version: AtomicU64::new(0),
            owns_backend,
            closed: AtomicBool::new(false),
        });

        let stop = CancellationToken::new();
        let weak: Weak<KvInner<T, C>> = Arc::downgrade(&inner);
        spawn_flush_task("kv-index", Some(full_check), flush_all, stop.clone(), move |tick| {
            match weak.upgrade() {
                Some(inner) => {
                    inner.writer.lock().on_tick(tick);
                    true
                }
                None => false,
            }
        });

        debug!("Index ready");
        Self { inner, stop }
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Number of writes waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.inner.writer.lock().len()
    }
}

impl<T, C> Index<T> for KvIndex<T, C>
where
    T: Clone + Send + 'static,
    C: Codec<T>,
{
    fn get(&self, addr: &Addr) -> Result<ReadOnlyObservable<IndexValue<T>>, StorageError> {
        self.check_open()?;
        let inner = &self.inner;
        inner.cache.get_or_load(addr, || {
            let (raw, version) = {
                let writer = inner.writer.lock();
                let raw = writer.read(&writer.key(addr.as_bytes()))?;
                (raw, inner.version.load(Ordering::SeqCst))
            };
            let value = match raw {
                Some(raw) => IndexValue::Set(inner.codec.decode(&raw)?),
                None => IndexValue::Unset(addr.clone()),
            };
            Ok((value, version))
        })
    }
}

impl<T, C> SetterIndex<T> for KvIndex<T, C>
where
    T: Clone + Send + 'static,
    C: Codec<T>,
{
    fn set(&self, addr: Addr, value: T) -> Result<(), StorageError> {
        self.check_open()?;
        let raw = self.inner.codec.encode(&value)?;
        let version = {
            let mut writer = self.inner.writer.lock();
            let key = writer.key(addr.as_bytes());
            writer.push(BatchOp::Put { key, value: raw })?;
            self.inner.version.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.inner.cache.publish(&addr, IndexValue::Set(value), version);
        Ok(())
    }

    fn delete(&self, addr: &Addr) -> Result<(), StorageError> {
        self.check_open()?;
        let version = {
            let mut writer = self.inner.writer.lock();
            let key = writer.key(addr.as_bytes());
            writer.push(BatchOp::Delete { key })?;
            let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
            writer.flush()?;
            version
        };
        self.inner.cache.publish(addr, IndexValue::Unset(addr.clone()), version);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.check_open()?;
        self.inner.writer.lock().flush()
    }

    #[instrument(skip(self))]
    fn close(&self) -> Result<(), StorageError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop.cancel();

        let flushed = {
            let mut writer = self.inner.writer.lock();
            let result = writer.flush();
            if self.inner.owns_backend {
                writer.backend().close()?;
            }
            result
        };
        self.inner.cache.clear();

        info!("Closed index");
        flushed
    }
}

impl<T, C> SeqTracker for KvIndex<T, C>
where
    T: Clone + Send + 'static,
    C: Codec<T>,
{
    fn get_seq(&self) -> Result<Seq, StorageError> {
        self.inner.writer.lock().get_seq()
    }

    fn set_seq(&self, seq: Seq) -> Result<(), StorageError> {
        self.check_open()?;
        self.inner.writer.lock().set_seq(seq)
    }
}

impl<T, C> Drop for KvIndex<T, C> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
