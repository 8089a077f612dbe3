//! Key-value store trait and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors that can occur during key-value store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// I/O error reaching the backing file
    #[error("I/O error: {0}")]
    IoError(String),

    /// Database error (redb, lock poisoning)
    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Durability options for a single write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Flush to stable storage before the write returns.
    pub sync: bool,
}

impl WriteOptions {
    pub fn sync() -> Self {
        Self { sync: true }
    }
}

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered list of mutations applied atomically by [`KvStore::write`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Sorted, prefix-iterable key-value store.
///
/// Implementations must be safe for one writer and many readers at a time;
/// they manage their own internal locking.
///
/// # Design Notes
///
/// - Keys are compared bytewise, so `scan_prefix` returns entries in key order.
/// - `write` is all-or-nothing: readers observe either none or all of a batch.
/// - Missing keys are `Ok(None)` on read and a no-op on delete.
pub trait KvStore: Send + Sync {
    /// Retrieves the value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8], opts: WriteOptions) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch, opts)
    }

    /// Removes `key` if present.
    fn delete(&self, key: &[u8], opts: WriteOptions) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch, opts)
    }

    /// Applies every operation of `batch` atomically, in order.
    fn write(&self, batch: WriteBatch, opts: WriteOptions) -> Result<(), StoreError>;

    /// Returns all entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn write(&self, batch: WriteBatch, opts: WriteOptions) -> Result<(), StoreError> {
        (**self).write(batch, opts)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        (**self).scan_prefix(prefix)
    }
}

/// In-memory store backed by a `BTreeMap`.
///
/// Nothing is persisted. Useful for unit tests, benchmarks and ephemeral
/// indexes.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.entries.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::DatabaseError(format!("Lock poisoned: {}", e)))?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, batch: WriteBatch, _opts: WriteOptions) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StoreError::DatabaseError(format!("Lock poisoned: {}", e)))?;
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::DatabaseError(format!("Lock poisoned: {}", e)))?;
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_operations() {
        let store = MemoryKvStore::new();
        assert!(store.get(b"a").unwrap().is_none());

        store.put(b"a", b"1", WriteOptions::default()).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        store.put(b"a", b"2", WriteOptions::sync()).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));

        store.delete(b"a", WriteOptions::default()).unwrap();
        assert!(store.get(b"a").unwrap().is_none());

        // Deleting a missing key is a no-op
        store.delete(b"missing", WriteOptions::default()).unwrap();
    }

    #[test]
    fn test_batch_applies_in_order() {
        let store = MemoryKvStore::new();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"first".to_vec());
        batch.delete(b"k".to_vec());
        batch.put(b"k".to_vec(), b"last".to_vec());
        batch.put(b"other".to_vec(), b"x".to_vec());
        assert_eq!(batch.len(), 4);

        store.write(batch, WriteOptions::default()).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"last".to_vec()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_scan_prefix_is_ordered_and_bounded() {
        let store = MemoryKvStore::new();
        for key in ["p:b", "p:a", "q:a", "p:c", "o:z"] {
            store
                .put(key.as_bytes(), b"v", WriteOptions::default())
                .unwrap();
        }

        let keys: Vec<String> = store
            .scan_prefix(b"p:")
            .unwrap()
            .into_iter()
            .map(|(k, _)| String::from_utf8(k).unwrap())
            .collect();
        assert_eq!(keys, vec!["p:a", "p:b", "p:c"]);
        assert!(store.scan_prefix(b"zz").unwrap().is_empty());
    }
}
