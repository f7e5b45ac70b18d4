//! Monotonic sequence counter with blocking waits
//!
//! A [`SequenceObservable`] counts the entries of a log. Readers that have
//! caught up with the tail call [`SequenceObservable::wait_for`] and are
//! parked in a waiter map keyed by the count they need. Every
//! [`SequenceObservable::inc`] releases all waiters whose key has been
//! reached.
//!
//! Dropping a pending [`WaitFor`] removes its registration, so cancelled
//! live queries never leave queued waiters behind.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::seq::Seq;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct SeqState {
    value: u64,
    next_waiter: u64,
    waiters: BTreeMap<u64, Vec<Waiter>>,
}

/// Thread-safe, monotonically increasing counter
#[derive(Clone)]
pub struct SequenceObservable {
    state: Arc<Mutex<SeqState>>,
}

impl SequenceObservable {
    /// Create a counter starting at `start`
    pub fn new(start: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SeqState {
                value: start,
                next_waiter: 0,
                waiters: BTreeMap::new(),
            })),
        }
    }

    /// Current counter value
    pub fn value(&self) -> u64 {
        self.state.lock().value
    }

    /// Increment the counter and release every waiter it reached
    pub fn inc(&self) -> u64 {
        let mut state = self.state.lock();
        state.value += 1;
        let value = state.value;

        let pending = state.waiters.split_off(&(value + 1));
        let ready = std::mem::replace(&mut state.waiters, pending);
        drop(state);

        for waiter in ready.into_values().flatten() {
            // The receiver may already be gone; that is a cancelled wait.
            let _ = waiter.tx.send(());
        }
        value
    }

    /// Resolve once the counter reaches or passes `n`
    ///
    /// Resolves immediately if the counter is already at or beyond `n`.
    pub fn wait_for(&self, n: u64) -> WaitFor {
        let mut state = self.state.lock();
        if state.value >= n {
            return WaitFor { pending: None };
        }

        let id = state.next_waiter;
        state.next_waiter += 1;
        let (tx, rx) = oneshot::channel();
        state.waiters.entry(n).or_default().push(Waiter { id, tx });

        WaitFor {
            pending: Some(PendingWait {
                state: Arc::clone(&self.state),
                key: n,
                id,
                rx,
            }),
        }
    }

    /// Number of queued waiters
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.values().map(Vec::len).sum()
    }

    /// A view that can observe but never advance the counter
    pub fn read_only(&self) -> ReadOnlySequence {
        ReadOnlySequence(self.clone())
    }
}

impl Default for SequenceObservable {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for SequenceObservable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SequenceObservable")
            .field("value", &state.value)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

struct PendingWait {
    state: Arc<Mutex<SeqState>>,
    key: u64,
    id: u64,
    rx: oneshot::Receiver<()>,
}

/// Future returned by [`SequenceObservable::wait_for`]
#[must_use = "futures do nothing unless awaited"]
pub struct WaitFor {
    pending: Option<PendingWait>,
}

impl WaitFor {
    /// True if the wait was satisfied at registration time
    pub fn is_ready(&self) -> bool {
        self.pending.is_none()
    }
}

impl Future for WaitFor {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let Some(pending) = this.pending.as_mut() else {
            return Poll::Ready(());
        };

        match Pin::new(&mut pending.rx).poll(cx) {
            Poll::Ready(_) => {
                this.pending = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for WaitFor {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        let mut state = pending.state.lock();
        if let Some(waiters) = state.waiters.get_mut(&pending.key) {
            waiters.retain(|w| w.id != pending.id);
            if waiters.is_empty() {
                state.waiters.remove(&pending.key);
            }
        }
    }
}

/// Read-only view of a log's tail counter
///
/// The counter holds the number of entries, so the tail seq is one less.
#[derive(Clone, Debug)]
pub struct ReadOnlySequence(SequenceObservable);

impl ReadOnlySequence {
    /// Number of entries observed so far
    pub fn count(&self) -> u64 {
        self.0.value()
    }

    /// Seq of the last entry, or `SEQ_EMPTY` for an empty log
    pub fn tail(&self) -> Seq {
        self.0.value() as Seq - 1
    }

    /// Resolve once the counter reaches `n`
    pub fn wait_for(&self, n: u64) -> WaitFor {
        self.0.wait_for(n)
    }

    /// Resolve once the entry at `seq` exists
    pub fn wait_for_seq(&self, seq: Seq) -> WaitFor {
        self.0.wait_for(seq.max(-1) as u64 + 1)
    }

    pub fn waiting(&self) -> usize {
        self.0.waiting()
    }
}
