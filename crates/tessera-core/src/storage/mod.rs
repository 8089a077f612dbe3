//! Sorted key-value storage backing the vector index.
//!
//! The vector index keeps its whole graph in a single ordered keyspace and is
//! namespaced purely by key prefix, so the store contract is small: point
//! reads and writes, atomic multi-key batches, and prefix scans.
//!
//! # Implementations
//!
//! - [`MemoryKvStore`] - Ordered in-memory map for tests and benchmarks
//! - [`RedbKvStore`] - On-disk redb B-tree (feature `redb-store`)

mod kv_store;

#[cfg(feature = "redb-store")]
mod redb_store;

pub use kv_store::{BatchOp, KvStore, MemoryKvStore, StoreError, WriteBatch, WriteOptions};

#[cfg(feature = "redb-store")]
pub use redb_store::RedbKvStore;
