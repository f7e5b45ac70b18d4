//! Roaring bitmap multilog over a key/value backend

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use roaring::RoaringTreemap;
use strand_core::{Addr, Seq};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use super::{MultiLog, Sublog};
use crate::error::StorageError;
use crate::index::SeqTracker;
use crate::persist::{
    BatchConfig, BatchOp, BatchWriter, CURRENT_SEQ_KEY, FlushTick, KvBackend, spawn_flush_task,
};

/// Configuration for a roaring multilog
#[derive(Debug, Clone)]
pub struct MultiLogConfig {
    /// Period of the background flush of changed bitmaps
    pub flush_interval: Duration,
    /// Serialized size above which a bitmap is rebuilt before writing
    pub compact_threshold_bytes: usize,
    /// Consecutive background failures before `set_seq` is refused
    pub max_consecutive_failures: Option<u32>,
}

impl Default for MultiLogConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(13),
            compact_threshold_bytes: 4096,
            max_consecutive_failures: Some(8),
        }
    }
}

impl MultiLogConfig {
    /// Short flush period for tests
    pub fn testing() -> Self {
        Self {
            flush_interval: Duration::from_millis(30),
            compact_threshold_bytes: 64,
            max_consecutive_failures: Some(3),
        }
    }

    fn batch_config(&self) -> BatchConfig {
        // bitmaps are staged only at flush time, so the size limits never fire
        BatchConfig {
            full_check_interval: self.flush_interval,
            flush_all_interval: self.flush_interval,
            lower_limit: usize::MAX,
            full_limit: usize::MAX,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

struct Inner {
    sublogs: Mutex<HashMap<Addr, Arc<Sublog>>>,
    writer: Mutex<BatchWriter>,
    compact_threshold: usize,
    owns_backend: bool,
    closed: AtomicBool,
}

impl Inner {
    /// Stage every changed bitmap and return how many were staged
    ///
    /// Lock order is sublogs, then writer.
    fn stage_dirty(
        &self,
        writer: &mut BatchWriter,
        sublogs: &HashMap<Addr, Arc<Sublog>>,
    ) -> Result<usize, StorageError> {
        let mut staged = 0;
        for sublog in sublogs.values() {
            let Some(bitmap) = sublog.take_dirty() else {
                continue;
            };
            let value = match encode_bitmap(&bitmap, self.compact_threshold) {
                Ok(value) => value,
                Err(e) => {
                    sublog.mark_dirty();
                    return Err(e);
                }
            };
            let key = writer.key(sublog.addr().as_bytes());
            writer.stage(BatchOp::Put { key, value });
            staged += 1;
        }
        Ok(staged)
    }

    fn flush(&self) -> Result<(), StorageError> {
        let sublogs = self.sublogs.lock();
        let mut writer = self.writer.lock();
        let staged = self.stage_dirty(&mut writer, &sublogs)?;
        trace!(staged, "Flushing multilog");
        writer.flush()
    }

    fn on_tick(&self) {
        let sublogs = self.sublogs.lock();
        let mut writer = self.writer.lock();
        if writer.is_tripped() {
            trace!("Multilog writer tripped, skipping background flush");
            return;
        }
        match self.stage_dirty(&mut writer, &sublogs) {
            // staged ops stay buffered in the writer if the write fails
            Ok(_) => writer.on_tick(FlushTick::All),
            Err(e) => debug!(error = %e, "Failed to stage bitmaps"),
        }
    }
}

/// Multilog keeping one roaring bitmap per key
///
/// Changed bitmaps are written by a background task every
/// `flush_interval`, or by an explicit [`MultiLog::flush`], in one batch
/// together with the resume position.
pub struct RoaringMultiLog {
    inner: Arc<Inner>,
    stop: CancellationToken,
}

impl RoaringMultiLog {
    /// Multilog owning `backend`
    pub fn new(backend: Arc<dyn KvBackend>, config: MultiLogConfig) -> Self {
        Self::build(backend, Vec::new(), config, true)
    }

    /// Multilog sharing `backend` with others under `prefix`
    pub fn with_key_prefix(
        backend: Arc<dyn KvBackend>,
        prefix: impl Into<Vec<u8>>,
        config: MultiLogConfig,
    ) -> Self {
        Self::build(backend, prefix.into(), config, false)
    }

    #[instrument(skip_all, fields(prefix = %String::from_utf8_lossy(&prefix)))]
    fn build(
        backend: Arc<dyn KvBackend>,
        prefix: Vec<u8>,
        config: MultiLogConfig,
        owns_backend: bool,
    ) -> Self {
        let inner = Arc::new(Inner {
            sublogs: Mutex::new(HashMap::new()),
            writer: Mutex::new(BatchWriter::new(backend, prefix, config.batch_config())),
            compact_threshold: config.compact_threshold_bytes,
            owns_backend,
            closed: AtomicBool::new(false),
        });

        let stop = CancellationToken::new();
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        spawn_flush_task("multilog", None, config.flush_interval, stop.clone(), move |_| {
            match weak.upgrade() {
                Some(inner) => {
                    inner.on_tick();
                    true
                }
                None => false,
            }
        });

        debug!("Multilog ready");
        Self { inner, stop }
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Read a stored bitmap, honouring buffered writes
    fn read_bitmap(&self, addr: &Addr) -> Result<RoaringTreemap, StorageError> {
        let raw = {
            let writer = self.inner.writer.lock();
            writer.read(&writer.key(addr.as_bytes()))?
        };
        match raw {
            Some(raw) => decode_bitmap(&raw),
            None => Ok(RoaringTreemap::new()),
        }
    }
}

impl MultiLog for RoaringMultiLog {
    fn get(&self, addr: &Addr) -> Result<Arc<Sublog>, StorageError> {
        self.check_open()?;
        let mut sublogs = self.inner.sublogs.lock();
        if let Some(sublog) = sublogs.get(addr) {
            return Ok(Arc::clone(sublog));
        }

        let bitmap = self.read_bitmap(addr)?;
        let sublog = Arc::new(Sublog::new(addr.clone(), bitmap));
        sublogs.insert(addr.clone(), Arc::clone(&sublog));
        Ok(sublog)
    }

    fn list(&self) -> Result<Vec<Addr>, StorageError> {
        self.check_open()?;
        self.inner.flush()?;

        let (prefix, entries) = {
            let writer = self.inner.writer.lock();
            let prefix = writer.key_prefix().to_vec();
            let entries = writer.backend().scan_prefix(&prefix)?;
            (prefix, entries)
        };

        let mut addrs = BTreeSet::new();
        for (key, value) in entries {
            let addr = &key[prefix.len()..];
            if addr == CURRENT_SEQ_KEY {
                continue;
            }
            if decode_bitmap(&value)?.is_empty() {
                continue;
            }
            addrs.insert(Addr::from(addr));
        }
        Ok(addrs.into_iter().collect())
    }

    fn delete(&self, addr: &Addr) -> Result<(), StorageError> {
        self.check_open()?;
        let mut sublogs = self.inner.sublogs.lock();
        if let Some(sublog) = sublogs.remove(addr) {
            sublog.mark_deleted();
        }

        // the flush carries the seq marker, so it must carry every bitmap too
        let mut writer = self.inner.writer.lock();
        self.inner.stage_dirty(&mut writer, &sublogs)?;
        let key = writer.key(addr.as_bytes());
        writer.push(BatchOp::Delete { key })?;
        writer.flush()?;

        debug!(addr = %addr, "Deleted sublog");
        Ok(())
    }

    fn load_bitmap(&self, addr: &Addr) -> Result<RoaringTreemap, StorageError> {
        self.check_open()?;
        let cached = self.inner.sublogs.lock().get(addr).cloned();
        match cached {
            Some(sublog) => Ok(sublog.bitmap()),
            None => self.read_bitmap(addr),
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.check_open()?;
        self.inner.flush()
    }

    #[instrument(skip(self))]
    fn close(&self) -> Result<(), StorageError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop.cancel();

        let flushed = self.inner.flush();
        if self.inner.owns_backend {
            self.inner.writer.lock().backend().close()?;
        }
        self.inner.sublogs.lock().clear();

        info!("Closed multilog");
        flushed
    }
}

impl SeqTracker for RoaringMultiLog {
    fn get_seq(&self) -> Result<Seq, StorageError> {
        self.inner.writer.lock().get_seq()
    }

    fn set_seq(&self, seq: Seq) -> Result<(), StorageError> {
        self.check_open()?;
        self.inner.writer.lock().set_seq(seq)
    }
}

impl Drop for RoaringMultiLog {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Serialize a bitmap, rebuilding large ones if that makes them smaller
fn encode_bitmap(bitmap: &RoaringTreemap, compact_threshold: usize) -> Result<Vec<u8>, StorageError> {
    let mut chosen = Cow::Borrowed(bitmap);
    let size = bitmap.serialized_size();
    if size > compact_threshold {
        if let Ok(rebuilt) = RoaringTreemap::from_sorted_iter(bitmap.iter()) {
            let rebuilt_size = rebuilt.serialized_size();
            if rebuilt_size < size {
                trace!(before = size, after = rebuilt_size, "Compacted bitmap");
                chosen = Cow::Owned(rebuilt);
            }
        }
    }

    let mut buf = Vec::with_capacity(chosen.serialized_size());
    chosen
        .serialize_into(&mut buf)
        .map_err(|e| StorageError::serialization(format!("failed to encode bitmap: {e}")))?;
    Ok(buf)
}

fn decode_bitmap(raw: &[u8]) -> Result<RoaringTreemap, StorageError> {
    RoaringTreemap::deserialize_from(raw)
        .map_err(|e| StorageError::deserialization(format!("failed to decode bitmap: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryBackend, ScanResults};
    use std::sync::atomic::AtomicBool;

    fn open(backend: &MemoryBackend) -> RoaringMultiLog {
        RoaringMultiLog::new(Arc::new(backend.clone()), MultiLogConfig::testing())
    }

    #[test]
    fn test_flush_and_reopen() {
        let backend = MemoryBackend::new();
        {
            let mlog = open(&backend);
            let alice = mlog.get(&Addr::from("alice")).unwrap();
            alice.add(1).unwrap();
            alice.add(4).unwrap();
            mlog.set_seq(4).unwrap();
            assert_eq!(backend.len(), 0);
            mlog.flush().unwrap();
        }

        let mlog = open(&backend.reopen());
        assert_eq!(mlog.get_seq().unwrap(), 4);
        let alice = mlog.get(&Addr::from("alice")).unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.contains(4));
    }

    #[test]
    fn test_list_skips_empty_and_marker() {
        let backend = MemoryBackend::new();
        let mlog = open(&backend);
        mlog.get(&Addr::from("a")).unwrap().add(0).unwrap();
        mlog.get(&Addr::from("b")).unwrap();
        mlog.get(&Addr::from("c")).unwrap().add(2).unwrap();
        mlog.set_seq(2).unwrap();

        assert_eq!(mlog.list().unwrap(), vec![Addr::from("a"), Addr::from("c")]);
    }

    #[test]
    fn test_delete_invalidates_handles() {
        let backend = MemoryBackend::new();
        let mlog = open(&backend);
        let addr = Addr::from("a");
        let sublog = mlog.get(&addr).unwrap();
        sublog.add(3).unwrap();
        mlog.flush().unwrap();

        mlog.delete(&addr).unwrap();
        assert!(sublog.is_deleted());
        assert!(sublog.add(4).is_err());
        assert!(mlog.list().unwrap().is_empty());
        assert!(mlog.load_bitmap(&addr).unwrap().is_empty());
        assert!(mlog.get(&addr).unwrap().is_empty());
    }

    #[test]
    fn test_delete_writes_pending_bitmaps_with_marker() {
        let backend = MemoryBackend::new();
        let mlog = open(&backend);
        let alice = mlog.get(&Addr::from("alice")).unwrap();
        for seq in 0..=5 {
            alice.add(seq).unwrap();
        }
        mlog.get(&Addr::from("bob")).unwrap().add(6).unwrap();
        mlog.set_seq(6).unwrap();
        mlog.delete(&Addr::from("bob")).unwrap();

        // crash: dropped without flush or close
        drop(alice);
        drop(mlog);

        let reopened = open(&backend.reopen());
        assert_eq!(reopened.get_seq().unwrap(), 6);
        assert_eq!(reopened.load_bitmap(&Addr::from("alice")).unwrap().len(), 6);
        assert!(reopened.load_bitmap(&Addr::from("bob")).unwrap().is_empty());
    }

    #[test]
    fn test_load_bitmap_prefers_open_sublog() {
        let backend = MemoryBackend::new();
        let mlog = open(&backend);
        let addr = Addr::from("a");
        mlog.get(&addr).unwrap().add(8).unwrap();

        let bitmap = mlog.load_bitmap(&addr).unwrap();
        assert!(bitmap.contains(8));
        assert!(mlog.load_bitmap(&Addr::from("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_compaction_keeps_members() {
        let mut bitmap = RoaringTreemap::new();
        for seq in (0..10_000u64).step_by(3) {
            bitmap.insert(seq);
        }
        let raw = encode_bitmap(&bitmap, 16).unwrap();
        assert_eq!(decode_bitmap(&raw).unwrap(), bitmap);
    }

    #[test]
    fn test_prefixes_isolate_multilogs() {
        let backend = MemoryBackend::new();
        let shared: Arc<dyn KvBackend> = Arc::new(backend.clone());
        let by_author = RoaringMultiLog::with_key_prefix(shared.clone(), "author/", MultiLogConfig::testing());
        let by_type = RoaringMultiLog::with_key_prefix(shared, "type/", MultiLogConfig::testing());

        by_author.get(&Addr::from("x")).unwrap().add(1).unwrap();
        by_author.set_seq(1).unwrap();
        by_author.close().unwrap();

        assert!(!backend.is_closed());
        assert!(by_type.list().unwrap().is_empty());
        assert_eq!(by_type.get_seq().unwrap(), strand_core::SEQ_EMPTY);
    }

    /// Backend that fails every write once switched on
    struct BrokenWrites {
        inner: MemoryBackend,
        broken: AtomicBool,
    }

    impl KvBackend for BrokenWrites {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key)
        }

        fn write_batch(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StorageError::database("read-only filesystem"));
            }
            self.inner.write_batch(ops)
        }

        fn scan_prefix(&self, prefix: &[u8]) -> Result<ScanResults, StorageError> {
            self.inner.scan_prefix(prefix)
        }

        fn close(&self) -> Result<(), StorageError> {
            self.inner.close()
        }
    }

    #[tokio::test]
    async fn test_background_failures_trip_set_seq() {
        let backend = Arc::new(BrokenWrites {
            inner: MemoryBackend::new(),
            broken: AtomicBool::new(true),
        });
        let config = MultiLogConfig::testing();
        let period = config.flush_interval;
        let mlog = RoaringMultiLog::new(backend.clone(), config);

        mlog.get(&Addr::from("a")).unwrap().add(1).unwrap();
        mlog.set_seq(1).unwrap();

        tokio::time::sleep(period * 8).await;
        assert!(matches!(mlog.set_seq(2), Err(StorageError::CircuitOpen { .. })));

        backend.broken.store(false, Ordering::SeqCst);
        mlog.flush().unwrap();
        mlog.set_seq(2).unwrap();
        assert!(backend.inner.get(b"a").unwrap().is_some());
    }
}
