//! File-backed offset log
//!
//! Entries are stored as length-prefixed frames in a single file:
//!
//! ```text
//! [len: i64 BE][payload: len bytes] [len: i64 BE][payload] ...
//! ```
//!
//! A nulled entry keeps its frame but stores the negated length followed by
//! zeroed bytes, so offsets of later entries never move. The offset table is
//! rebuilt by replaying the file on open.

use std::io::SeekFrom;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use strand_core::{Codec, LogError, ReadOnlySequence, Seq, SequenceObservable};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{Log, Query, QuerySpec, check_bounds};
use crate::error::StorageError;

const FRAME_HEADER: u64 = 8;
const LOG_FILE: &str = "offset.log";

/// Configuration for an offset log
#[derive(Debug, Clone)]
pub struct OffsetLogConfig {
    /// Directory holding the log file
    pub dir: PathBuf,
    /// Whether to sync writes to disk immediately
    pub sync_on_write: bool,
    /// Largest payload `append` accepts, in bytes
    ///
    /// Complete frames already on disk are replayed whatever their size.
    pub max_frame_size: usize,
}

impl Default for OffsetLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/log"),
            sync_on_write: true,
            max_frame_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl OffsetLogConfig {
    /// Default configuration for a log in `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }
}

struct FileState {
    file: Option<File>,
    /// Start offset of each frame, indexed by seq
    offsets: Vec<u64>,
    /// End of the last complete frame
    end: u64,
}

/// Append-only log in a single file
pub struct OffsetLog<T, C> {
    config: OffsetLogConfig,
    path: PathBuf,
    codec: C,
    state: Mutex<FileState>,
    seq: SequenceObservable,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> OffsetLog<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    /// Open or create the log, replaying existing frames
    #[instrument(skip_all, fields(dir = %config.dir.display()))]
    pub async fn open(config: OffsetLogConfig, codec: C) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.dir).await?;
        let path = config.dir.join(LOG_FILE);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let file_size = file.metadata().await?.len();
        let (offsets, end) = replay(&file, file_size).await?;

        if end < file_size {
            warn!(
                valid = end,
                file_size,
                "Truncated trailing frame, cutting log"
            );
            file.set_len(end).await?;
            file.sync_all().await?;
        }

        let count = offsets.len() as u64;
        info!(path = %path.display(), entries = count, "Opened offset log");

        Ok(Self {
            config,
            path,
            codec,
            state: Mutex::new(FileState {
                file: Some(file),
                offsets,
                end,
            }),
            seq: SequenceObservable::new(count),
            _marker: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries, nulled ones included
    pub async fn len(&self) -> usize {
        self.state.lock().await.offsets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sync and release the file; later calls fail
    pub async fn close(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if let Some(file) = state.file.take() {
            file.sync_all().await?;
            info!(path = %self.path.display(), "Closed offset log");
        }
        Ok(())
    }
}

/// Walk the frames of `file` and return their offsets plus the end of the
/// last complete frame
///
/// Only a frame whose header or payload runs past the end of the file ends
/// the walk early.
async fn replay(file: &File, file_size: u64) -> Result<(Vec<u64>, u64), StorageError> {
    let mut reader = BufReader::new(file.try_clone().await?);
    reader.seek(SeekFrom::Start(0)).await?;

    let mut offsets = Vec::new();
    let mut offset = 0u64;

    while offset < file_size {
        if file_size - offset < FRAME_HEADER {
            break;
        }
        let mut len_buf = [0u8; 8];
        reader.read_exact(&mut len_buf).await?;

        let len = i64::from_be_bytes(len_buf).unsigned_abs();
        if file_size - offset - FRAME_HEADER < len {
            warn!(offset, len, "Frame runs past end of file, stopping replay");
            break;
        }

        // Skip the payload, it is decoded on demand
        let skipped = tokio::io::copy(&mut (&mut reader).take(len), &mut tokio::io::sink()).await?;
        if skipped != len {
            break;
        }

        offsets.push(offset);
        offset += FRAME_HEADER + len;
    }

    debug!(entries = offsets.len(), end = offset, "Replayed offset log");
    Ok((offsets, offset))
}

fn closed() -> LogError {
    LogError::io("offset log is closed")
}

#[async_trait]
impl<T, C> Log<T> for OffsetLog<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    async fn append(&self, value: T) -> Result<Seq, LogError> {
        let payload = self.codec.encode(&value)?;
        if payload.len() > self.config.max_frame_size {
            return Err(LogError::codec(format!(
                "frame of {} bytes exceeds limit of {}",
                payload.len(),
                self.config.max_frame_size
            )));
        }

        let mut state = self.state.lock().await;
        let offset = state.end;
        let file = state.file.as_mut().ok_or_else(closed)?;

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&(payload.len() as i64).to_be_bytes()).await?;
        file.write_all(&payload).await?;
        if self.config.sync_on_write {
            file.sync_data().await?;
        }

        state.offsets.push(offset);
        state.end = offset + FRAME_HEADER + payload.len() as u64;
        let seq = state.offsets.len() as Seq - 1;
        self.seq.inc();

        debug!(seq, bytes = payload.len(), "Appended frame");
        Ok(seq)
    }

    async fn get(&self, seq: Seq) -> Result<T, LogError> {
        let mut state = self.state.lock().await;
        let idx = check_bounds(seq, state.offsets.len())?;
        let offset = state.offsets[idx];
        let file = state.file.as_mut().ok_or_else(closed)?;

        file.seek(SeekFrom::Start(offset)).await?;
        let mut len_buf = [0u8; 8];
        file.read_exact(&mut len_buf).await?;
        let len = i64::from_be_bytes(len_buf);
        if len < 0 {
            return Err(LogError::Nulled { seq });
        }

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload).await?;
        drop(state);

        self.codec.decode(&payload)
    }

    fn seq(&self) -> ReadOnlySequence {
        self.seq.read_only()
    }

    fn query(self: Arc<Self>, specs: &[QuerySpec]) -> Result<Query<T>, LogError> {
        Query::new(self, specs)
    }

    async fn null(&self, seq: Seq) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        let idx = check_bounds(seq, state.offsets.len())?;
        let offset = state.offsets[idx];
        let file = state.file.as_mut().ok_or_else(closed)?;

        file.seek(SeekFrom::Start(offset)).await?;
        let mut len_buf = [0u8; 8];
        file.read_exact(&mut len_buf).await?;
        let len = i64::from_be_bytes(len_buf);
        if len < 0 {
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&(-len).to_be_bytes()).await?;
        file.write_all(&vec![0u8; len as usize]).await?;
        if self.config.sync_on_write {
            file.sync_data().await?;
        }

        info!(seq, "Nulled log entry");
        Ok(())
    }
}
