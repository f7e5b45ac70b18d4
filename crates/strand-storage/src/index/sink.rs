//! Stream processor that feeds a log into an index

use std::sync::Arc;

use parking_lot::Mutex;
use strand_core::{LogError, SEQ_EMPTY, Seq};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::SeqTracker;
use crate::error::StorageError;
use crate::log::{Log, QueryItem, QuerySpec, gt, live, seq_wrap};

/// User function applied to every log entry: `(seq, value, target)`
pub type StreamProcFn<T, S> =
    Box<dyn Fn(Seq, &T, &S) -> Result<(), StorageError> + Send + Sync>;

/// Where a sink index is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// Nothing processed yet
    Uninitialized,
    /// Will continue after the given seq
    Resuming(Seq),
    /// Consuming a live query
    Streaming,
    Closed,
}

/// Drives a [`SeqTracker`] (an index or a multilog) from a log
///
/// Each seq-wrapped entry is handed to the user function; on success the
/// entry's seq is recorded with `set_seq`. Nulled entries skip the function
/// but still advance the position. An error from the function stops the
/// stream without recording that entry.
pub struct SinkIndex<T, S: ?Sized> {
    target: Arc<S>,
    proc_fn: StreamProcFn<T, S>,
    state: Mutex<SinkState>,
}

impl<T, S> SinkIndex<T, S>
where
    T: Send + 'static,
    S: SeqTracker + ?Sized,
{
    /// Attach `proc_fn` to `target`, reading its stored resume position
    pub fn new(target: Arc<S>, proc_fn: StreamProcFn<T, S>) -> Result<Self, StorageError> {
        let seq = target.get_seq()?;
        let state = if seq == SEQ_EMPTY {
            SinkState::Uninitialized
        } else {
            SinkState::Resuming(seq)
        };
        Ok(Self {
            target,
            proc_fn,
            state: Mutex::new(state),
        })
    }

    pub fn target(&self) -> &Arc<S> {
        &self.target
    }

    pub fn state(&self) -> SinkState {
        *self.state.lock()
    }

    /// Query constraints that continue right after the processed position
    pub fn query_spec(&self) -> Result<Vec<QuerySpec>, StorageError> {
        Ok(vec![gt(self.target.get_seq()?), seq_wrap(true)])
    }

    /// Process one query result
    pub fn pour(&self, item: QueryItem<T>) -> Result<(), StorageError> {
        match item {
            QueryItem::Wrapped(wrapped) => {
                (self.proc_fn)(wrapped.seq, &wrapped.value, self.target.as_ref())?;
                self.target.set_seq(wrapped.seq)
            }
            QueryItem::Nulled(seq) => {
                debug!(seq, "Skipping nulled entry");
                self.target.set_seq(seq)
            }
            QueryItem::Value(_) => Err(LogError::invalid_query(
                "sink index needs seq-wrapped entries",
            )
            .into()),
        }
    }

    /// Process everything currently in `log` and return the new position
    #[instrument(skip_all)]
    pub async fn catch_up(&self, log: Arc<dyn Log<T>>) -> Result<Seq, StorageError> {
        let mut query = log.query(&self.query_spec()?)?;
        let mut processed = 0u64;
        while let Some(item) = query.next().await {
            self.pour(item?)?;
            processed += 1;
        }

        let seq = self.target.get_seq()?;
        if processed > 0 {
            *self.state.lock() = SinkState::Resuming(seq);
        }
        debug!(processed, seq, "Caught up");
        Ok(seq)
    }

    /// Follow `log` live until `token` is cancelled or processing fails
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        log: Arc<dyn Log<T>>,
        token: &CancellationToken,
    ) -> Result<(), StorageError> {
        let mut specs = self.query_spec()?;
        specs.push(live(true));
        let mut query = log.query(&specs)?;

        *self.state.lock() = SinkState::Streaming;
        info!(from = self.target.get_seq()?, "Sink index streaming");

        let result = loop {
            match query.next_cancellable(token).await {
                None | Some(Err(LogError::Cancelled)) => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(item)) => {
                    if let Err(e) = self.pour(item) {
                        warn!(error = %e, "Sink index stopped");
                        break Err(e);
                    }
                }
            }
        };

        *self.state.lock() = SinkState::Closed;
        result
    }
}
