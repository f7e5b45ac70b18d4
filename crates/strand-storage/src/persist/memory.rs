//! In-memory key/value backend for testing and simulation

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use super::{BatchOp, KvBackend, ScanResults};
use crate::error::StorageError;

/// Ordered map backend; clones share the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// A fresh, open handle onto the same data
    pub fn reopen(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn write_batch(&self, ops: &[BatchOp]) -> Result<(), StorageError> {
        self.check_open()?;
        let mut data = self.data.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    data.remove(key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<ScanResults, StorageError> {
        self.check_open()?;
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reopen_shares_data() {
        let backend = MemoryBackend::new();
        backend
            .write_batch(&[BatchOp::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }])
            .unwrap();
        backend.close().unwrap();
        assert!(backend.get(b"k").is_err());

        let fresh = backend.reopen();
        assert_eq!(fresh.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_scan_prefix_stops_at_boundary() {
        let backend = MemoryBackend::new();
        let ops: Vec<BatchOp> = ["a/1", "a/2", "b/1"]
            .iter()
            .map(|k| BatchOp::Put {
                key: k.as_bytes().to_vec(),
                value: vec![],
            })
            .collect();
        backend.write_batch(&ops).unwrap();

        assert_eq!(backend.scan_prefix(b"a/").unwrap().len(), 2);
        assert_eq!(backend.scan_prefix(b"").unwrap().len(), 3);
    }
}
