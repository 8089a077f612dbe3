//! Key layout and a write-buffering view of the HNSW graph.
//!
//! # Keys
//!
//! All keys start with the index prefix (default `vector:`):
//!
//! - `{prefix}vector:{id}` -> raw vector, f64 little-endian
//! - `{prefix}meta:{id}` -> `NodeMeta` (JSON)
//! - `{prefix}neighbors:{level}:{id}` -> neighbor ids (JSON array)
//! - `{prefix}entrypoint` -> `EntryPoint` (JSON)
//! - `{prefix}count` -> number of vectors, u64 little-endian
//!
//! Adjacency is kept symmetric: `b` is in `a`'s list at level `l` exactly when
//! `a` is in `b`'s. A node's own list is therefore also its reverse adjacency.

use crate::distance::{decode_vector, encode_vector, DistanceType};
use crate::error::VectorIndexError;
use crate::storage::{KvStore, WriteBatch};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Builds every key the index uses from one prefix.
#[derive(Debug, Clone)]
pub(crate) struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn vector(&self, id: &str) -> Vec<u8> {
        format!("{}vector:{}", self.prefix, id).into_bytes()
    }

    pub fn meta(&self, id: &str) -> Vec<u8> {
        format!("{}meta:{}", self.prefix, id).into_bytes()
    }

    pub fn meta_prefix(&self) -> Vec<u8> {
        format!("{}meta:", self.prefix).into_bytes()
    }

    pub fn neighbors(&self, level: usize, id: &str) -> Vec<u8> {
        format!("{}neighbors:{}:{}", self.prefix, level, id).into_bytes()
    }

    pub fn neighbors_prefix(&self) -> Vec<u8> {
        format!("{}neighbors:", self.prefix).into_bytes()
    }

    pub fn entry_point(&self) -> Vec<u8> {
        format!("{}entrypoint", self.prefix).into_bytes()
    }

    pub fn count(&self) -> Vec<u8> {
        format!("{}count", self.prefix).into_bytes()
    }

    /// Extracts the node id from a `meta:` key.
    pub fn id_from_meta_key(&self, key: &[u8]) -> Option<String> {
        let prefix = self.meta_prefix();
        key.strip_prefix(prefix.as_slice())
            .and_then(|rest| std::str::from_utf8(rest).ok())
            .map(str::to_string)
    }
}

/// Per-node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct NodeMeta {
    pub level: usize,
}

/// The node every descent starts from: the highest-level node in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EntryPoint {
    pub id: String,
    pub level: usize,
}

/// Net change produced by one committed transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct GraphDelta {
    /// Change in directed adjacency entries (twice the undirected edge change).
    pub adjacency: i64,
    /// Change in vector count.
    pub vectors: i64,
}

/// Reads through pending writes, buffers new ones, and turns them into one
/// atomic [`WriteBatch`].
///
/// Searches use a transaction too and simply drop it; the decoded-vector
/// cache then only saves repeated reads during that search.
pub(crate) struct GraphTxn<'a, S: KvStore + ?Sized> {
    store: &'a S,
    keys: &'a KeySpace,
    dimension: usize,
    metric: DistanceType,
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    vectors: HashMap<String, Arc<Vec<f64>>>,
    delta: GraphDelta,
}

impl<'a, S: KvStore + ?Sized> GraphTxn<'a, S> {
    pub fn new(store: &'a S, keys: &'a KeySpace, dimension: usize, metric: DistanceType) -> Self {
        Self {
            store,
            keys,
            dimension,
            metric,
            pending: BTreeMap::new(),
            vectors: HashMap::new(),
            delta: GraphDelta::default(),
        }
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, VectorIndexError> {
        match self.pending.get(key) {
            Some(value) => Ok(value.clone()),
            None => Ok(self.store.get(key)?),
        }
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending.insert(key, Some(value));
    }

    fn remove(&mut self, key: Vec<u8>) {
        self.pending.insert(key, None);
    }

    /// Prefix scan over the store with pending writes applied.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, VectorIndexError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.store.scan_prefix(prefix)?.into_iter().collect();
        for (key, value) in self.pending.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(v) => merged.insert(key.clone(), v.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Level of `id`, or `None` if the node is absent.
    pub fn level(&self, id: &str) -> Result<Option<usize>, VectorIndexError> {
        match self.get(&self.keys.meta(id))? {
            Some(bytes) => {
                let meta: NodeMeta = serde_json::from_slice(&bytes).map_err(|e| {
                    VectorIndexError::Corrupted(format!("unreadable metadata for {}: {}", id, e))
                })?;
                Ok(Some(meta.level))
            }
            None => Ok(None),
        }
    }

    /// Raw vector of `id`.
    ///
    /// Any node reachable through the graph must have its bytes; a miss is
    /// corruption, never a silent skip.
    pub fn vector(&mut self, id: &str) -> Result<Arc<Vec<f64>>, VectorIndexError> {
        if let Some(v) = self.vectors.get(id) {
            return Ok(Arc::clone(v));
        }
        let bytes = self.get(&self.keys.vector(id))?.ok_or_else(|| {
            VectorIndexError::Corrupted(format!("vector bytes missing for referenced node {}", id))
        })?;
        let vector = Arc::new(decode_vector(&bytes, self.dimension).map_err(|e| {
            VectorIndexError::Corrupted(format!("undecodable vector for {}: {}", id, e))
        })?);
        self.vectors.insert(id.to_string(), Arc::clone(&vector));
        Ok(vector)
    }

    /// Distance from `query` to the stored vector of `id`.
    pub fn distance(&mut self, query: &[f64], id: &str) -> Result<f64, VectorIndexError> {
        let metric = self.metric;
        let vector = self.vector(id)?;
        Ok(metric.distance(query, &vector))
    }

    /// Distance between two stored vectors.
    pub fn distance_between(&mut self, a: &str, b: &str) -> Result<f64, VectorIndexError> {
        let va = self.vector(a)?;
        self.distance(&va, b)
    }

    /// Writes vector bytes and metadata for a new node and bumps the count.
    pub fn put_node(&mut self, id: &str, vector: &[f64], level: usize) -> Result<(), VectorIndexError> {
        let meta = serde_json::to_vec(&NodeMeta { level }).map_err(|e| {
            VectorIndexError::Corrupted(format!("failed to encode metadata for {}: {}", id, e))
        })?;
        self.put(self.keys.vector(id), encode_vector(vector));
        self.put(self.keys.meta(id), meta);
        self.vectors.insert(id.to_string(), Arc::new(vector.to_vec()));
        self.adjust_count(1)
    }

    /// Removes vector bytes and metadata and decrements the count.
    ///
    /// Adjacency must already be unlinked.
    pub fn remove_node(&mut self, id: &str) -> Result<(), VectorIndexError> {
        self.remove(self.keys.vector(id));
        self.remove(self.keys.meta(id));
        self.vectors.remove(id);
        self.adjust_count(-1)
    }

    /// Highest-level remaining node, ties broken by smallest id.
    pub fn highest_node(&self) -> Result<Option<EntryPoint>, VectorIndexError> {
        let mut best: Option<EntryPoint> = None;
        for (key, value) in self.scan_prefix(&self.keys.meta_prefix())? {
            let Some(id) = self.keys.id_from_meta_key(&key) else {
                continue;
            };
            let meta: NodeMeta = serde_json::from_slice(&value).map_err(|e| {
                VectorIndexError::Corrupted(format!("unreadable metadata for {}: {}", id, e))
            })?;
            if best.as_ref().is_none_or(|b| meta.level > b.level) {
                best = Some(EntryPoint {
                    id,
                    level: meta.level,
                });
            }
        }
        Ok(best)
    }

    // =========================================================================
    // Adjacency
    // =========================================================================

    pub fn neighbors(&self, level: usize, id: &str) -> Result<Vec<String>, VectorIndexError> {
        match self.get(&self.keys.neighbors(level, id))? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                VectorIndexError::Corrupted(format!(
                    "unreadable neighbor list for {} at level {}: {}",
                    id, level, e
                ))
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Replaces a neighbor list; an empty list deletes the key.
    pub fn set_neighbors(
        &mut self,
        level: usize,
        id: &str,
        neighbors: Vec<String>,
    ) -> Result<(), VectorIndexError> {
        let old_len = self.neighbors(level, id)?.len() as i64;
        self.delta.adjacency += neighbors.len() as i64 - old_len;

        let key = self.keys.neighbors(level, id);
        if neighbors.is_empty() {
            self.remove(key);
        } else {
            let bytes = serde_json::to_vec(&neighbors).map_err(|e| {
                VectorIndexError::Corrupted(format!("failed to encode neighbors for {}: {}", id, e))
            })?;
            self.put(key, bytes);
        }
        Ok(())
    }

    /// Adds the symmetric edge `a <-> b` at `level` if missing.
    pub fn link(&mut self, level: usize, a: &str, b: &str) -> Result<(), VectorIndexError> {
        for (from, to) in [(a, b), (b, a)] {
            let mut list = self.neighbors(level, from)?;
            if !list.iter().any(|n| n == to) {
                list.push(to.to_string());
                self.set_neighbors(level, from, list)?;
            }
        }
        Ok(())
    }

    /// Removes the symmetric edge `a <-> b` at `level` if present.
    pub fn unlink(&mut self, level: usize, a: &str, b: &str) -> Result<(), VectorIndexError> {
        for (from, to) in [(a, b), (b, a)] {
            let mut list = self.neighbors(level, from)?;
            let before = list.len();
            list.retain(|n| n != to);
            if list.len() != before {
                self.set_neighbors(level, from, list)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Graph-wide keys
    // =========================================================================

    pub fn entry_point(&self) -> Result<Option<EntryPoint>, VectorIndexError> {
        match self.get(&self.keys.entry_point())? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                VectorIndexError::Corrupted(format!("unreadable entry point: {}", e))
            }),
            None => Ok(None),
        }
    }

    pub fn set_entry_point(&mut self, entry: Option<&EntryPoint>) -> Result<(), VectorIndexError> {
        match entry {
            Some(entry) => {
                let bytes = serde_json::to_vec(entry).map_err(|e| {
                    VectorIndexError::Corrupted(format!("failed to encode entry point: {}", e))
                })?;
                self.put(self.keys.entry_point(), bytes);
            }
            None => self.remove(self.keys.entry_point()),
        }
        Ok(())
    }

    pub fn count(&self) -> Result<u64, VectorIndexError> {
        match self.get(&self.keys.count())? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    VectorIndexError::Corrupted(format!(
                        "vector count has {} bytes, expected 8",
                        bytes.len()
                    ))
                })?;
                Ok(u64::from_le_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn adjust_count(&mut self, delta: i64) -> Result<(), VectorIndexError> {
        let current = self.count()? as i64;
        let next = (current + delta).max(0) as u64;
        self.put(self.keys.count(), next.to_le_bytes().to_vec());
        self.delta.vectors += delta;
        Ok(())
    }

    /// Sum of all neighbor list lengths, read from the store.
    pub fn adjacency_entries(&self) -> Result<u64, VectorIndexError> {
        let mut total = 0u64;
        for (key, value) in self.scan_prefix(&self.keys.neighbors_prefix())? {
            let list: Vec<String> = serde_json::from_slice(&value).map_err(|e| {
                VectorIndexError::Corrupted(format!(
                    "unreadable neighbor list at {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ))
            })?;
            total += list.len() as u64;
        }
        Ok(total)
    }

    /// Consumes the transaction, producing the batch and its net effect.
    pub fn into_batch(self) -> (WriteBatch, GraphDelta) {
        let mut batch = WriteBatch::new();
        for (key, value) in self.pending {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.delete(key),
            }
        }
        (batch, self.delta)
    }
}
