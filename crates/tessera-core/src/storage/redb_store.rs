//! Redb-backed key-value store.
//!
//! Uses [redb](https://github.com/cberner/redb) - a pure Rust, ACID-compliant,
//! embedded B-tree database. The whole keyspace lives in one table; callers
//! namespace by key prefix.
//!
//! # Tables
//!
//! - `kv`: raw key bytes -> raw value bytes

use super::{BatchOp, KvStore, StoreError, WriteBatch, WriteOptions};
use redb::{Database, Durability, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const KV_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");

/// Redb-backed store for on-disk vector indexes.
///
/// Every [`write`](KvStore::write) is a single redb write transaction, so a
/// batch is atomic. redb serializes writers and lets readers proceed against
/// the last committed snapshot.
///
/// # Example
///
/// ```ignore
/// use tessera_core::storage::{KvStore, RedbKvStore, WriteOptions};
///
/// let store = RedbKvStore::open("./data/vectors.redb")?;
/// store.put(b"key", b"value", WriteOptions::sync())?;
/// ```
#[derive(Clone)]
pub struct RedbKvStore {
    db: Arc<Database>,
}

impl RedbKvStore {
    /// Opens or creates a redb database at the given path, making sure the
    /// `kv` table exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Database::create(path).map_err(db_err("open database"))?;

        let txn = db.begin_write().map_err(db_err("begin write"))?;
        txn.open_table(KV_TABLE).map_err(db_err("create kv table"))?;
        txn.commit().map_err(db_err("commit table creation"))?;

        debug!("Opened redb store at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }
}

/// Wraps a redb error with the step that produced it.
fn db_err<E: std::fmt::Display>(step: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::DatabaseError(format!("redb {step}: {e}"))
}

impl KvStore for RedbKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read().map_err(db_err("begin read"))?;
        let table = txn.open_table(KV_TABLE).map_err(db_err("open kv table"))?;
        let value = table.get(key).map_err(db_err("get"))?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn write(&self, batch: WriteBatch, opts: WriteOptions) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut txn = self.db.begin_write().map_err(db_err("begin write"))?;
        let durability = if opts.sync {
            Durability::Immediate
        } else {
            Durability::Eventual
        };
        txn.set_durability(durability);

        {
            let mut table = txn.open_table(KV_TABLE).map_err(db_err("open kv table"))?;
            for op in batch.ops() {
                match op {
                    BatchOp::Put { key, value } => {
                        table
                            .insert(key.as_slice(), value.as_slice())
                            .map_err(db_err("insert"))?;
                    }
                    BatchOp::Delete { key } => {
                        table.remove(key.as_slice()).map_err(db_err("remove"))?;
                    }
                }
            }
        }

        txn.commit().map_err(db_err("commit batch"))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let txn = self.db.begin_read().map_err(db_err("begin read"))?;
        let table = txn.open_table(KV_TABLE).map_err(db_err("open kv table"))?;

        let mut entries = Vec::new();
        // Keys are ordered, so the matching run ends at the first miss
        for item in table.range::<&[u8]>(prefix..).map_err(db_err("range"))? {
            let (key, value) = item.map_err(db_err("range entry"))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.value().to_vec()));
        }
        Ok(entries)
    }
}
