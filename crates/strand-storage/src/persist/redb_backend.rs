//! redb key/value backend
//!
//! All owners share one `kv` table; isolation between indexes that share a
//! database comes from key prefixes.

use std::path::PathBuf;

use parking_lot::RwLock;
use redb::{Builder, Database, ReadableTable, TableDefinition};
use tracing::{debug, info, instrument};

use super::{BatchOp, KvBackend, ScanResults};
use crate::error::StorageError;

// Key: owner prefix + addr bytes, Value: encoded value, bitmap or seq marker
const KV: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");

/// Configuration for the redb backend
#[derive(Debug, Clone)]
pub struct RedbBackendConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Cache size in bytes
    pub cache_size: usize,
}

impl Default for RedbBackendConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/strand.redb"),
            cache_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl RedbBackendConfig {
    /// Default configuration for a database file at `path`
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Default::default()
        }
    }
}

/// Durable backend on a single redb database file
pub struct RedbBackend {
    db: RwLock<Option<Database>>,
    config: RedbBackendConfig,
}

impl RedbBackend {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbBackendConfig) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Builder::new()
            .set_cache_size(config.cache_size)
            .create(&config.db_path)
            .map_err(StorageError::database)?;

        // Create the table up front so read transactions never miss it
        let write_txn = db.begin_write().map_err(StorageError::database)?;
        write_txn.open_table(KV).map_err(StorageError::database)?;
        write_txn.commit().map_err(StorageError::database)?;

        info!("Opened redb backend");

        Ok(Self {
            db: RwLock::new(Some(db)),
            config,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &RedbBackendConfig {
        &self.config
    }
}

impl KvBackend for RedbBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;

        let read_txn = db.begin_read().map_err(StorageError::database)?;
        let table = read_txn.open_table(KV).map_err(StorageError::database)?;

        let value = table
            .get(key)
            .map_err(StorageError::database)?
            .map(|v| v.value().to_vec());

        Ok(value)
    }

    fn write_batch(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;

        let write_txn = db.begin_write().map_err(StorageError::database)?;
        {
            let mut table = write_txn.open_table(KV).map_err(StorageError::database)?;
            for (i, op) in ops.iter().enumerate() {
                let applied = match op {
                    BatchOp::Put { key, value } => {
                        table.insert(key.as_slice(), value.as_slice()).map(|_| ())
                    }
                    BatchOp::Delete { key } => table.remove(key.as_slice()).map(|_| ()),
                };
                applied.map_err(|e| StorageError::Database(format!("batch op #{i}: {e}")))?;
            }
        }
        write_txn.commit().map_err(StorageError::database)?;

        debug!(ops = ops.len(), "Committed batch");
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<ScanResults, StorageError> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StorageError::Closed)?;

        let read_txn = db.begin_read().map_err(StorageError::database)?;
        let table = read_txn.open_table(KV).map_err(StorageError::database)?;

        let mut results = Vec::new();

        // Use range to get all keys >= prefix
        let range = table.range(prefix..).map_err(StorageError::database)?;

        for entry in range {
            let (key, value) = entry.map_err(StorageError::database)?;
            let key_bytes = key.value();

            // Stop when we're past the prefix
            if !key_bytes.starts_with(prefix) {
                break;
            }

            results.push((key_bytes.to_vec(), value.value().to_vec()));
        }

        Ok(results)
    }

    fn close(&self) -> Result<(), StorageError> {
        if self.db.write().take().is_some() {
            info!(path = %self.config.db_path.display(), "Closed redb backend");
        }
        Ok(())
    }
}
