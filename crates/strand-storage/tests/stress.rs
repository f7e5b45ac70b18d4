//! Stress tests for strand-storage
//!
//! These tests verify log linearization, live fan-out, batch limits and
//! multilog consistency under concurrent load.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use strand_core::PostcardCodec;
use strand_storage::{
    Addr, BatchConfig, Index, IndexValue, KvBackend, KvIndex, Log, MemLog, MemoryBackend,
    MultiLog, MultiLogConfig, OffsetLog, OffsetLogConfig, RoaringMultiLog, Seq, SeqTracker,
    SetterIndex, gt, limit, live, seq_wrap,
};
use tempfile::TempDir;

// ============================================================================
// Append linearization
// ============================================================================

/// Concurrent writers on a memory log get unique, contiguous seqs
///
/// Each writer's own entries must also appear in the order it appended them.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mem_appends_are_linearized() {
    let log: Arc<MemLog<(u32, u32)>> = Arc::new(MemLog::new());
    let writers = 8u32;
    let per_writer = 500u32;

    let start = Instant::now();
    let mut handles = Vec::new();
    for w in 0..writers {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            let mut seqs = Vec::with_capacity(per_writer as usize);
            for i in 0..per_writer {
                seqs.push(log.append((w, i)).await.unwrap());
            }
            seqs
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        let seqs = handle.await.unwrap();
        assert!(seqs.windows(2).all(|p| p[0] < p[1]));
        all.extend(seqs);
    }
    println!(
        "Appended {} entries from {} writers in {:?}",
        all.len(),
        writers,
        start.elapsed()
    );

    all.sort_unstable();
    let expected: Vec<Seq> = (0..(writers * per_writer) as Seq).collect();
    assert_eq!(all, expected);
    assert_eq!(log.seq().tail(), (writers * per_writer) as Seq - 1);

    // per-writer order survives in the log itself
    let mut last_seen: HashMap<u32, u32> = HashMap::new();
    for seq in 0..(writers * per_writer) as Seq {
        let (w, i) = log.get(seq).await.unwrap();
        if let Some(prev) = last_seen.insert(w, i) {
            assert!(prev < i, "writer {w} out of order at seq {seq}");
        }
    }
}

/// Concurrent writers on a file log replay identically after reopen
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_offset_appends_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let config = OffsetLogConfig {
        sync_on_write: false,
        ..OffsetLogConfig::in_dir(dir.path())
    };

    let written = {
        let log = Arc::new(OffsetLog::open(config.clone(), PostcardCodec::<(u32, u32)>::new()).await.unwrap());
        let mut handles = Vec::new();
        for w in 0..4u32 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let mut out = Vec::new();
                for i in 0..100u32 {
                    out.push((log.append((w, i)).await.unwrap(), (w, i)));
                }
                out
            }));
        }
        let mut written = Vec::new();
        for handle in handles {
            written.extend(handle.await.unwrap());
        }
        log.close().await.unwrap();
        written
    };

    let log = OffsetLog::open(config, PostcardCodec::<(u32, u32)>::new()).await.unwrap();
    assert_eq!(log.len().await, 400);
    for (seq, value) in written {
        assert_eq!(log.get(seq).await.unwrap(), value);
    }
}

// ============================================================================
// Live fan-out
// ============================================================================

/// Many live readers each see every append exactly once, in order
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_live_readers() {
    let log: Arc<MemLog<u64>> = Arc::new(MemLog::new());
    let readers = 16;
    let total = 200u64;

    let mut handles = Vec::new();
    for _ in 0..readers {
        let query = log
            .clone()
            .query(&[gt(-1), live(true), seq_wrap(true), limit(total as i64)])
            .unwrap();
        handles.push(tokio::spawn(query.collect_all()));
    }

    for v in 0..total {
        log.append(v * 3).await.unwrap();
        if v % 50 == 0 {
            tokio::task::yield_now().await;
        }
    }

    for handle in handles {
        let items = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("reader stalled")
            .unwrap()
            .unwrap();
        assert_eq!(items.len(), total as usize);
        for (i, item) in items.into_iter().enumerate() {
            assert_eq!(item.seq(), Some(i as Seq));
            assert_eq!(item.into_value(), Some(i as u64 * 3));
        }
    }
}

// ============================================================================
// Batch limits
// ============================================================================

/// Setting far more keys than the hard limit never grows the buffer past it
#[test]
fn test_kv_index_hard_limit_under_load() {
    let backend = MemoryBackend::new();
    let config = BatchConfig {
        lower_limit: 64,
        full_limit: 256,
        ..BatchConfig::testing()
    };
    let idx: KvIndex<u64, PostcardCodec<u64>> = KvIndex::with_key_prefix(
        Arc::new(backend.reopen()),
        "counts/",
        PostcardCodec::new(),
        config,
    );

    // keys arrive in random order; the seq still only moves forward
    let keys = 10_000u64;
    let mut order: Vec<u64> = (0..keys).collect();
    order.shuffle(&mut rand::rng());
    for (seq, i) in order.into_iter().enumerate() {
        idx.set(Addr::from(format!("k{i:05}")), i).unwrap();
        idx.set_seq(seq as Seq).unwrap();
        assert!(idx.buffered() <= 256);
    }
    idx.flush().unwrap();
    assert_eq!(idx.buffered(), 0);

    // every key plus the seq marker reached the backend
    assert_eq!(backend.len(), keys as usize + 1);

    let reopened: KvIndex<u64, PostcardCodec<u64>> = KvIndex::with_key_prefix(
        Arc::new(backend.reopen()),
        "counts/",
        PostcardCodec::new(),
        BatchConfig::testing(),
    );
    assert_eq!(reopened.get_seq().unwrap(), keys as Seq - 1);
    assert_eq!(
        reopened.get(&Addr::from("k09999")).unwrap().value(),
        IndexValue::Set(9_999)
    );
}

// ============================================================================
// MultiLog concurrency
// ============================================================================

/// Concurrent adders on shared sublogs lose no members across a reopen
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_multilog_adds() {
    let backend = MemoryBackend::new();
    let mlog = Arc::new(RoaringMultiLog::new(
        Arc::new(backend.reopen()),
        MultiLogConfig::testing(),
    ));
    let keys = ["alice", "bob", "carol", "dave"];
    let per_task = 1_000i64;

    let mut handles = Vec::new();
    for t in 0..8i64 {
        let mlog = mlog.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..per_task {
                let seq = t * per_task + i;
                let key = keys[(seq % keys.len() as i64) as usize];
                mlog.get(&Addr::from(key)).unwrap().add(seq).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    mlog.set_seq(8 * per_task - 1).unwrap();
    mlog.close().unwrap();

    let backend: Arc<dyn KvBackend> = Arc::new(backend.reopen());
    let reopened = RoaringMultiLog::new(backend, MultiLogConfig::testing());
    assert_eq!(reopened.get_seq().unwrap(), 8 * per_task - 1);
    assert_eq!(reopened.list().unwrap().len(), keys.len());

    let mut total = 0;
    for (k, key) in keys.iter().enumerate() {
        let bitmap = reopened.load_bitmap(&Addr::from(*key)).unwrap();
        assert_eq!(bitmap.len(), 2 * per_task as u64);
        assert!(bitmap.iter().all(|s| s as usize % keys.len() == k));
        total += bitmap.len();
    }
    assert_eq!(total, 8 * per_task as u64);
}
