//! A store directory: the message log plus its author and type multilogs

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strand_core::JsonCodec;
use strand_storage::{
    Addr, KvBackend, Log, LogError, MultiLog, MultiLogConfig, OffsetLog, OffsetLogConfig,
    QueryItem, QuerySpec, RedbBackend, RedbBackendConfig, RoaringMultiLog, Seq, SeqTracker,
    SeqWrapper, SinkIndex, StreamProcFn, SubsetOperation, SubsetOptions, SubsetPlanner, gt, live,
    seq_wrap,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const LOG_DIR: &str = "log";
pub const INDEX_DB: &str = "indexes.redb";
pub const BY_AUTHOR_PREFIX: &str = "by_author/";
pub const BY_TYPE_PREFIX: &str = "by_type/";

/// A social message as stored in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub author: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: serde_json::Value,
}

impl Message {
    /// Build a message, keeping `content` as a plain string when it is not JSON
    pub fn new(author: impl Into<String>, kind: impl Into<String>, content: &str) -> Self {
        let content = serde_json::from_str(content)
            .unwrap_or_else(|_| serde_json::Value::String(content.to_string()));
        Self {
            author: author.into(),
            kind: kind.into(),
            content,
        }
    }
}

pub type MessageLog = OffsetLog<Message, JsonCodec<Message>>;

pub struct Store {
    log: Arc<MessageLog>,
    backend: Arc<dyn KvBackend>,
    by_author: Arc<RoaringMultiLog>,
    by_type: Arc<RoaringMultiLog>,
}

fn add_by(key: fn(&Message) -> &str) -> StreamProcFn<Message, RoaringMultiLog> {
    Box::new(move |seq: Seq, msg: &Message, mlog: &RoaringMultiLog| {
        mlog.get(&Addr::from(key(msg)))?.add(seq)?;
        Ok(())
    })
}

impl Store {
    /// Open (creating if needed) the store in `dir` and bring its indexes up to date
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating store directory {}", dir.display()))?;

        let log = OffsetLog::open(OffsetLogConfig::in_dir(dir.join(LOG_DIR)), JsonCodec::new())
            .await
            .context("opening message log")?;
        let backend: Arc<dyn KvBackend> = Arc::new(
            RedbBackend::open(RedbBackendConfig::at(dir.join(INDEX_DB)))
                .context("opening index database")?,
        );
        let config = MultiLogConfig::default();
        let store = Self {
            log: Arc::new(log),
            by_author: Arc::new(RoaringMultiLog::with_key_prefix(
                backend.clone(),
                BY_AUTHOR_PREFIX,
                config.clone(),
            )),
            by_type: Arc::new(RoaringMultiLog::with_key_prefix(
                backend.clone(),
                BY_TYPE_PREFIX,
                config,
            )),
            backend,
        };
        store.catch_up().await?;
        info!(dir = %dir.display(), entries = store.log.seq().count(), "Opened store");
        Ok(store)
    }

    pub fn log(&self) -> &Arc<MessageLog> {
        &self.log
    }

    /// Feed every message past each multilog's resume position into it
    pub async fn catch_up(&self) -> Result<()> {
        let authors = SinkIndex::new(self.by_author.clone(), add_by(|m| m.author.as_str()))?;
        let types = SinkIndex::new(self.by_type.clone(), add_by(|m| m.kind.as_str()))?;
        let a = authors.catch_up(self.log.clone()).await?;
        let t = types.catch_up(self.log.clone()).await?;
        debug!(by_author = a, by_type = t, "Indexes caught up");
        Ok(())
    }

    /// Append `msg` and index it
    pub async fn append(&self, msg: Message) -> Result<Seq> {
        let seq = self.log.append(msg).await?;
        self.catch_up().await?;
        Ok(seq)
    }

    pub async fn get(&self, seq: Seq) -> Result<Message> {
        Ok(self.log.get(seq).await?)
    }

    pub async fn null(&self, seq: Seq) -> Result<()> {
        Ok(self.log.null(seq).await?)
    }

    /// Run a finite query; results always carry their seqs
    pub async fn query(&self, mut specs: Vec<QuerySpec>) -> Result<Vec<QueryItem<Message>>> {
        specs.push(seq_wrap(true));
        let query = self.log.clone().query(&specs)?;
        Ok(query.collect_all().await?)
    }

    /// Follow the log until `token` fires, handing each new item to `out`
    ///
    /// Returns how many items were seen.
    pub async fn tail(
        &self,
        from_start: bool,
        token: &CancellationToken,
        mut out: impl FnMut(&QueryItem<Message>) -> Result<()>,
    ) -> Result<usize> {
        let start = if from_start { -1 } else { self.log.seq().tail() };
        let mut query = self
            .log
            .clone()
            .query(&[gt(start), live(true), seq_wrap(true)])?;

        let mut seen = 0;
        while let Some(item) = query.next_cancellable(token).await {
            match item {
                Ok(item) => {
                    out(&item)?;
                    seen += 1;
                }
                Err(LogError::Cancelled) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(seen)
    }

    /// Resume position of each multilog
    pub fn index_seqs(&self) -> Result<Vec<(&'static str, Seq)>> {
        Ok(vec![
            ("by_author", self.by_author.get_seq()?),
            ("by_type", self.by_type.get_seq()?),
        ])
    }

    /// Messages matching a JSON subset query
    pub async fn subset(&self, json: &str, opts: &SubsetOptions) -> Result<Vec<SeqWrapper<Message>>> {
        let planner = SubsetPlanner::new(self.by_author.clone(), self.by_type.clone());
        let op = SubsetOperation::parse(json, planner.limits())?;
        Ok(planner
            .query_subset_messages(self.log.as_ref(), &op, opts)
            .await?)
    }

    /// Flush the indexes and release every file
    pub async fn close(self) -> Result<()> {
        self.by_author.close()?;
        self.by_type.close()?;
        self.backend.close()?;
        self.log.close().await?;
        Ok(())
    }
}

/// JSON rendering of a query item: `{"seq":..,"value":..}` or `{"seq":..,"nulled":true}`
pub fn render(item: &QueryItem<Message>) -> Result<String> {
    let rendered = match item {
        QueryItem::Wrapped(w) => serde_json::to_string(w)?,
        QueryItem::Nulled(seq) => serde_json::json!({ "seq": seq, "nulled": true }).to_string(),
        QueryItem::Value(v) => serde_json::to_string(v)?,
    };
    Ok(rendered)
}
