//! End-to-end tests for strand-storage
//!
//! These tests wire a file-backed log, shared redb indexes, sink indexes and
//! the subset planner together, and simulate crashes by dropping every
//! handle and reopening from disk.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_core::{JsonCodec, PostcardCodec};
use strand_storage::{
    Addr, BatchConfig, Index, IndexValue, KvBackend, KvIndex, Log, MultiLog, MultiLogConfig,
    OffsetLog, OffsetLogConfig, RedbBackend, RedbBackendConfig, RoaringMultiLog, SEQ_EMPTY,
    Seq, SeqTracker, SetterIndex, SinkIndex, SinkState, StorageError, StreamProcFn, SubsetOperation,
    SubsetOptions, SubsetPlanner, gt, live, seq_wrap,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Message {
    author: String,
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

fn msg(author: &str, kind: &str, content: &str) -> Message {
    Message {
        author: author.into(),
        kind: kind.into(),
        content: content.into(),
    }
}

type MessageLog = OffsetLog<Message, JsonCodec<Message>>;

async fn open_log(dir: &TempDir) -> Arc<MessageLog> {
    Arc::new(
        OffsetLog::open(OffsetLogConfig::in_dir(dir.path().join("log")), JsonCodec::new())
            .await
            .unwrap(),
    )
}

fn open_backend(dir: &TempDir) -> Arc<dyn KvBackend> {
    Arc::new(RedbBackend::open(RedbBackendConfig::at(dir.path().join("indexes.redb"))).unwrap())
}

// ============================================================================
// Log + Query
// ============================================================================

/// Appends through a live query arrive in commit order with their seqs
#[tokio::test]
async fn test_live_query_over_offset_log() {
    let dir = TempDir::new().unwrap();
    let log = open_log(&dir).await;

    let mut query = log.clone().query(&[live(true), gt(-1), seq_wrap(true)]).unwrap();
    let writer = log.clone();
    tokio::spawn(async move {
        for content in ["x", "y", "z"] {
            writer.append(msg("alice", "post", content)).await.unwrap();
        }
    });

    for (expected_seq, content) in ["x", "y", "z"].iter().enumerate() {
        let item = query.next().await.unwrap().unwrap();
        assert_eq!(item.seq(), Some(expected_seq as i64));
        assert_eq!(item.into_value().unwrap().content, *content);
    }
}

// ============================================================================
// Index durability and resumption
// ============================================================================

/// Every set before a flush is readable through a fresh backend handle
#[tokio::test]
async fn test_flush_durability_across_handles() {
    let dir = TempDir::new().unwrap();
    {
        let idx: KvIndex<u64, PostcardCodec<u64>> =
            KvIndex::new(open_backend(&dir), PostcardCodec::new(), BatchConfig::default());
        for i in 0..100u64 {
            idx.set(Addr::from(format!("key-{i}")), i * 10).unwrap();
        }
        idx.flush().unwrap();
        idx.close().unwrap();
    }

    let idx: KvIndex<u64, PostcardCodec<u64>> =
        KvIndex::new(open_backend(&dir), PostcardCodec::new(), BatchConfig::default());
    for i in 0..100u64 {
        let value = idx.get(&Addr::from(format!("key-{i}"))).unwrap().value();
        assert_eq!(value, IndexValue::Set(i * 10));
    }
}

/// Counts messages per author into a durable index
fn count_by_author() -> StreamProcFn<Message, KvIndex<u64, PostcardCodec<u64>>> {
    Box::new(|_seq: Seq, m: &Message, idx: &KvIndex<u64, PostcardCodec<u64>>| {
        let addr = Addr::from(m.author.as_str());
        let current = idx.get(&addr)?.value().into_set().unwrap_or(0);
        idx.set(addr, current + 1)
    })
}

/// Entries processed before a crash are never processed twice
#[tokio::test]
async fn test_index_resumption_is_idempotent() {
    let dir = TempDir::new().unwrap();

    {
        let log = open_log(&dir).await;
        for i in 0..10 {
            let author = if i % 2 == 0 { "alice" } else { "bob" };
            log.append(msg(author, "post", &i.to_string())).await.unwrap();
        }

        let idx = Arc::new(KvIndex::new(open_backend(&dir), PostcardCodec::new(), BatchConfig::default()));
        let sink = SinkIndex::new(idx.clone(), count_by_author()).unwrap();
        assert_eq!(sink.catch_up(log.clone()).await.unwrap(), 9);
        idx.flush().unwrap();
        // crash: no close, every handle dropped
    }

    let log = open_log(&dir).await;
    let idx = Arc::new(KvIndex::new(open_backend(&dir), PostcardCodec::new(), BatchConfig::default()));
    assert_eq!(idx.get_seq().unwrap(), 9);

    let sink = SinkIndex::new(idx.clone(), count_by_author()).unwrap();
    assert_eq!(sink.state(), SinkState::Resuming(9));
    let mut resumed = log.clone().query(&sink.query_spec().unwrap()).unwrap();
    assert!(resumed.next().await.is_none());

    sink.catch_up(log).await.unwrap();
    assert_eq!(idx.get(&Addr::from("alice")).unwrap().value(), IndexValue::Set(5));
    assert_eq!(idx.get(&Addr::from("bob")).unwrap().value(), IndexValue::Set(5));
}

/// Unflushed work is redone after a crash, never skipped
#[tokio::test]
async fn test_unflushed_progress_is_replayed() {
    let dir = TempDir::new().unwrap();

    {
        let log = open_log(&dir).await;
        for i in 0..4 {
            log.append(msg("alice", "post", &i.to_string())).await.unwrap();
        }
        let idx = Arc::new(KvIndex::new(open_backend(&dir), PostcardCodec::new(), BatchConfig::default()));
        let sink = SinkIndex::new(idx.clone(), count_by_author()).unwrap();
        sink.catch_up(log).await.unwrap();
        // crash before any flush
    }

    let log = open_log(&dir).await;
    let idx = Arc::new(KvIndex::new(open_backend(&dir), PostcardCodec::new(), BatchConfig::default()));
    assert_eq!(idx.get_seq().unwrap(), SEQ_EMPTY);

    let sink = SinkIndex::new(idx.clone(), count_by_author()).unwrap();
    sink.catch_up(log).await.unwrap();
    assert_eq!(idx.get(&Addr::from("alice")).unwrap().value(), IndexValue::Set(4));
}

// ============================================================================
// MultiLog + Subset planner
// ============================================================================

struct Multilogs {
    by_author: Arc<RoaringMultiLog>,
    by_type: Arc<RoaringMultiLog>,
}

fn open_multilogs(backend: &Arc<dyn KvBackend>) -> Multilogs {
    Multilogs {
        by_author: Arc::new(RoaringMultiLog::with_key_prefix(
            backend.clone(),
            "by_author/",
            MultiLogConfig::default(),
        )),
        by_type: Arc::new(RoaringMultiLog::with_key_prefix(
            backend.clone(),
            "by_type/",
            MultiLogConfig::default(),
        )),
    }
}

fn add_to(key: fn(&Message) -> &str) -> StreamProcFn<Message, RoaringMultiLog> {
    Box::new(move |seq: Seq, m: &Message, mlog: &RoaringMultiLog| {
        mlog.get(&Addr::from(key(m)))?.add(seq)?;
        Ok(())
    })
}

async fn index_all(log: &Arc<MessageLog>, mlogs: &Multilogs) -> Result<(), StorageError> {
    let authors = SinkIndex::new(mlogs.by_author.clone(), add_to(|m| m.author.as_str()))?;
    let types = SinkIndex::new(mlogs.by_type.clone(), add_to(|m| m.kind.as_str()))?;
    authors.catch_up(log.clone()).await?;
    types.catch_up(log.clone()).await?;
    Ok(())
}

#[tokio::test]
async fn test_subset_pipeline_survives_restart() {
    let dir = TempDir::new().unwrap();
    let rows = [
        ("alice", "post", "hello"),
        ("bob", "post", "hi"),
        ("alice", "vote", "+1"),
        ("carol", "contact", "follow"),
        ("alice", "post", "again"),
    ];

    {
        let log = open_log(&dir).await;
        for (author, kind, content) in rows {
            log.append(msg(author, kind, content)).await.unwrap();
        }
        let backend = open_backend(&dir);
        let mlogs = open_multilogs(&backend);
        index_all(&log, &mlogs).await.unwrap();
        mlogs.by_author.close().unwrap();
        mlogs.by_type.close().unwrap();
        backend.close().unwrap();
    }

    let log = open_log(&dir).await;
    let backend = open_backend(&dir);
    let mlogs = open_multilogs(&backend);
    assert_eq!(mlogs.by_author.get_seq().unwrap(), 4);
    assert_eq!(mlogs.by_type.get_seq().unwrap(), 4);
    assert_eq!(
        mlogs.by_author.list().unwrap(),
        vec![Addr::from("alice"), Addr::from("bob"), Addr::from("carol")]
    );

    let planner = SubsetPlanner::new(mlogs.by_author.clone(), mlogs.by_type.clone());
    let op = SubsetOperation::parse(
        r#"{"op":"and","args":[{"op":"author","feed":"alice"},{"op":"type","string":"post"}]}"#,
        planner.limits(),
    )
    .unwrap();

    let opts = SubsetOptions {
        descending: true,
        page_limit: None,
    };
    let found = planner.query_subset_messages(log.as_ref(), &op, &opts).await.unwrap();
    let contents: Vec<&str> = found.iter().map(|w| w.value.content.as_str()).collect();
    assert_eq!(contents, vec!["again", "hello"]);
}

#[tokio::test]
async fn test_live_sink_feeds_multilog() {
    let dir = TempDir::new().unwrap();
    let log = open_log(&dir).await;
    let backend = open_backend(&dir);
    let mlogs = open_multilogs(&backend);

    let sink = Arc::new(SinkIndex::new(mlogs.by_author.clone(), add_to(|m| m.author.as_str())).unwrap());
    let token = CancellationToken::new();
    let runner = {
        let sink = sink.clone();
        let log: Arc<dyn Log<Message>> = log.clone();
        let token = token.clone();
        tokio::spawn(async move { sink.run(log, &token).await })
    };

    // a live query over the sublog sees members as the sink adds them
    let alice = mlogs.by_author.get(&Addr::from("alice")).unwrap();
    let mut members = alice.clone().query(&[live(true)]).unwrap();

    log.append(msg("alice", "post", "one")).await.unwrap();
    log.append(msg("bob", "post", "two")).await.unwrap();
    log.append(msg("alice", "post", "three")).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), members.next()).await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), members.next()).await.unwrap();
    assert_eq!(first.unwrap().unwrap().into_value(), Some(0));
    assert_eq!(second.unwrap().unwrap().into_value(), Some(2));

    token.cancel();
    runner.await.unwrap().unwrap();
    assert_eq!(sink.state(), SinkState::Closed);
}
