//! Write buffer with transactional flushes
//!
//! A [`BatchWriter`] belongs to exactly one index or multilog and is always
//! used under its owner's lock.

use std::sync::Arc;
use std::time::Duration;

use strand_core::{SEQ_EMPTY, SEQ_ERRORED, Seq, decode_seq, encode_seq};
use tracing::{debug, error, trace, warn};

use super::{BatchOp, FlushTick, KvBackend};
use crate::error::StorageError;

/// Reserved key (under the owner's prefix) holding the resume position
pub const CURRENT_SEQ_KEY: &[u8] = b"__current_observable";

/// Tuning for batched persistence
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Period of the "flush if full" check
    pub full_check_interval: Duration,
    /// Period of the unconditional flush, bounding write latency
    pub flush_all_interval: Duration,
    /// Buffered operations needed before a full-check tick flushes
    pub lower_limit: usize,
    /// Buffered operations that force a synchronous flush inside `set`
    pub full_limit: usize,
    /// Consecutive background failures before writes are refused;
    /// `None` logs and retries forever
    pub max_consecutive_failures: Option<u32>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            full_check_interval: Duration::from_secs(5),
            flush_all_interval: Duration::from_secs(17),
            lower_limit: 32_000,
            // stays well below the per-transaction ceiling of typical backends
            full_limit: 75_000,
            max_consecutive_failures: Some(8),
        }
    }
}

impl BatchConfig {
    /// Small limits and short periods for tests
    pub fn testing() -> Self {
        Self {
            full_check_interval: Duration::from_millis(20),
            flush_all_interval: Duration::from_millis(60),
            lower_limit: 4,
            full_limit: 16,
            max_consecutive_failures: Some(3),
        }
    }
}

/// Buffered writes plus the resume position of one owner
pub struct BatchWriter {
    backend: Arc<dyn KvBackend>,
    key_prefix: Vec<u8>,
    ops: Vec<BatchOp>,
    cur_seq: Seq,
    seq_dirty: bool,
    config: BatchConfig,
    consecutive_failures: u32,
    tripped: bool,
}

impl BatchWriter {
    /// Create a writer storing keys under `key_prefix`
    pub fn new(backend: Arc<dyn KvBackend>, key_prefix: Vec<u8>, config: BatchConfig) -> Self {
        Self {
            backend,
            key_prefix,
            ops: Vec::new(),
            cur_seq: SEQ_ERRORED,
            seq_dirty: false,
            config,
            consecutive_failures: 0,
            tripped: false,
        }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub fn key_prefix(&self) -> &[u8] {
        &self.key_prefix
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Backend key for `addr`
    pub fn key(&self, addr: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.key_prefix.len() + addr.len());
        key.extend_from_slice(&self.key_prefix);
        key.extend_from_slice(addr);
        key
    }

    /// Backend key of the resume position marker
    pub fn seq_key(&self) -> Vec<u8> {
        self.key(CURRENT_SEQ_KEY)
    }

    /// Number of buffered operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// True once background flushing has failed too often
    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    /// Refuse new writes while the writer is tripped
    pub fn check_circuit(&self) -> Result<(), StorageError> {
        if self.tripped {
            return Err(StorageError::CircuitOpen {
                failures: self.consecutive_failures,
            });
        }
        Ok(())
    }

    /// Buffer an operation, flushing synchronously above the hard limit
    pub fn push(&mut self, op: BatchOp) -> Result<(), StorageError> {
        self.check_circuit()?;
        self.ops.push(op);

        let n = self.ops.len();
        if n > self.config.full_limit {
            debug!(ops = n, "Batch above hard limit, flushing");
            self.flush().map_err(|e| {
                StorageError::Database(format!("failed to write big batch ({n}): {e}"))
            })?;
        }
        Ok(())
    }

    /// Buffer an operation without checking limits
    pub fn stage(&mut self, op: BatchOp) {
        self.ops.push(op);
    }

    /// Latest buffered write for `key`: `Some(None)` is a pending delete
    pub fn pending(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.ops.iter().rev().find(|op| op.key() == key).map(|op| match op {
            BatchOp::Put { value, .. } => Some(value.as_slice()),
            BatchOp::Delete { .. } => None,
        })
    }

    /// Read `key`, preferring buffered writes over the backend
    pub fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        match self.pending(key) {
            Some(value) => Ok(value.map(<[u8]>::to_vec)),
            None => self.backend.get(key),
        }
    }

    /// Record the resume position; it is written with the next flush
    ///
    /// Refused like [`BatchWriter::push`] while the writer is tripped.
    pub fn set_seq(&mut self, seq: Seq) -> Result<(), StorageError> {
        self.check_circuit()?;
        self.cur_seq = seq;
        self.seq_dirty = true;
        Ok(())
    }

    /// The resume position, loading the stored marker on first use
    pub fn get_seq(&mut self) -> Result<Seq, StorageError> {
        if self.cur_seq != SEQ_ERRORED {
            return Ok(self.cur_seq);
        }

        let seq = match self.backend.get(&self.seq_key())? {
            None => SEQ_EMPTY,
            Some(raw) => decode_seq(&raw).ok_or_else(|| {
                StorageError::deserialization(format!(
                    "expected seq marker of length 8, got {}",
                    raw.len()
                ))
            })?,
        };
        self.cur_seq = seq;
        Ok(seq)
    }

    /// Write all buffered operations and the resume position atomically
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.ops.is_empty() && !self.seq_dirty {
            return Ok(());
        }

        let mut batch = Vec::with_capacity(self.ops.len() + 1);
        let with_marker = self.seq_dirty && self.cur_seq != SEQ_ERRORED;
        if with_marker {
            batch.push(BatchOp::Put {
                key: self.seq_key(),
                value: encode_seq(self.cur_seq).to_vec(),
            });
        }
        batch.append(&mut self.ops);

        if let Err(e) = self.backend.write_batch(&batch) {
            // keep the ops for the next attempt; the marker is rebuilt then
            if with_marker {
                batch.remove(0);
            }
            self.ops = batch;
            return Err(e);
        }

        debug!(ops = batch.len(), seq = self.cur_seq, "Flushed batch");
        self.seq_dirty = false;
        self.consecutive_failures = 0;
        self.tripped = false;
        Ok(())
    }

    /// Handle one background timer tick
    ///
    /// Errors are logged, never returned. After the configured number of
    /// consecutive failures the writer trips and stops flushing from the
    /// background until an explicit [`BatchWriter::flush`] succeeds.
    pub fn on_tick(&mut self, tick: FlushTick) {
        if self.tripped {
            trace!("Writer tripped, skipping background flush");
            return;
        }

        let n = self.ops.len();
        if tick == FlushTick::IfFull && n < self.config.lower_limit {
            return;
        }
        if n == 0 && !self.seq_dirty {
            return;
        }

        if let Err(e) = self.flush() {
            self.consecutive_failures += 1;
            match self.config.max_consecutive_failures {
                Some(max) if self.consecutive_failures >= max => {
                    self.tripped = true;
                    error!(
                        error = %e,
                        failures = self.consecutive_failures,
                        "Background flush failing repeatedly, refusing further writes"
                    );
                }
                _ => {
                    warn!(
                        error = %e,
                        failures = self.consecutive_failures,
                        buffered = self.ops.len(),
                        "Background flush failed"
                    );
                }
            }
        }
    }
}
