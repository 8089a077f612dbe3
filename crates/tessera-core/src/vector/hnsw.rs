//! Hierarchical Navigable Small World graph persisted in a [`KvStore`].
//!
//! Every node gets a random level drawn from an exponential distribution with
//! mean `ml`. Upper layers are sparse express lanes; layer 0 holds every node.
//! Searches descend greedily from the entry point, then run a best-first
//! search of breadth `ef` at layer 0.
//!
//! Inserts and deletes run under an exclusive graph lock and commit as one
//! atomic batch. Searches share the lock, so they always see a whole graph.

use super::graph::{EntryPoint, GraphTxn, KeySpace};
use crate::config::{VectorIndexConfig, MAX_K, MAX_LEVEL, MAX_VECTOR_ID_LEN};
use crate::error::VectorIndexError;
use crate::storage::{KvStore, WriteOptions};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Exp};
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A search hit: vector id and its distance to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub id: String,
    pub distance: f64,
}

/// Point-in-time view of the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VectorIndexStats {
    pub vector_count: u64,
    /// Number of layers, i.e. entry point level + 1; 0 when empty.
    pub level_count: usize,
    /// Undirected edges summed over all layers.
    pub total_edges: u64,
    /// Mean neighbors per node across all layers.
    pub average_degree: f64,
    pub searches_performed: u64,
    pub inserts_performed: u64,
    pub deletes_performed: u64,
    pub last_insert_time: Option<SystemTime>,
    pub last_search_time: Option<SystemTime>,
}

/// Ordered by distance, then id, so results are deterministic under ties.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    distance: f64,
    id: String,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Values that change together on every write.
#[derive(Debug, Default)]
struct Gauges {
    vector_count: u64,
    adjacency_entries: u64,
    entry_level: Option<usize>,
    last_insert_time: Option<SystemTime>,
    last_search_time: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct StatsInner {
    searches: AtomicU64,
    inserts: AtomicU64,
    deletes: AtomicU64,
    gauges: RwLock<Gauges>,
}

/// HNSW index over any sorted key-value store.
///
/// # Example
///
/// ```ignore
/// use tessera_core::storage::MemoryKvStore;
/// use tessera_core::vector::HnswIndex;
/// use tessera_core::config::VectorIndexConfig;
/// use tokio_util::sync::CancellationToken;
///
/// let config = VectorIndexConfig { dimension: 3, ..Default::default() };
/// let index = HnswIndex::open(MemoryKvStore::new(), config)?;
/// let cancel = CancellationToken::new();
/// index.insert(&cancel, "a", &[1.0, 0.0, 0.0])?;
/// let hits = index.search(&cancel, &[1.0, 0.0, 0.0], 1)?;
/// assert_eq!(hits[0].id, "a");
/// ```
pub struct HnswIndex<S: KvStore> {
    store: S,
    config: VectorIndexConfig,
    keys: KeySpace,
    graph_lock: RwLock<()>,
    rng: Mutex<StdRng>,
    level_distribution: Exp<f64>,
    stats: StatsInner,
}

impl<S: KvStore> HnswIndex<S> {
    /// Opens the index stored under `config.prefix`, creating it if absent.
    pub fn open(store: S, config: VectorIndexConfig) -> Result<Self, VectorIndexError> {
        config.validate()?;

        let level_distribution = Exp::new(1.0 / config.ml)
            .map_err(|e| VectorIndexError::InvalidConfig(format!("ml {}: {}", config.ml, e)))?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let keys = KeySpace::new(&config.prefix);
        let gauges = {
            let txn = GraphTxn::new(&store, &keys, config.dimension, config.distance);
            Gauges {
                vector_count: txn.count()?,
                adjacency_entries: txn.adjacency_entries()?,
                entry_level: txn.entry_point()?.map(|e| e.level),
                ..Default::default()
            }
        };

        info!(
            "Opened vector index '{}' ({} vectors, dimension {}, {})",
            config.prefix, gauges.vector_count, config.dimension, config.distance
        );

        Ok(Self {
            store,
            keys,
            graph_lock: RwLock::new(()),
            rng: Mutex::new(rng),
            level_distribution,
            stats: StatsInner {
                gauges: RwLock::new(gauges),
                ..Default::default()
            },
            config,
        })
    }

    pub fn config(&self) -> &VectorIndexConfig {
        &self.config
    }

    /// Runs the checks `insert` performs before touching the graph.
    pub fn validate(&self, id: &str, vector: &[f64]) -> Result<(), VectorIndexError> {
        validate_id(id)?;
        self.validate_vector(vector)
    }

    /// Inserts `vector` under `id`, replacing any existing vector with that id.
    ///
    /// Fails without touching the graph if the id, dimension or components are
    /// invalid, or if `cancel` fires before the write starts.
    #[instrument(skip_all, fields(id = %id))]
    pub fn insert(
        &self,
        cancel: &CancellationToken,
        id: &str,
        vector: &[f64],
    ) -> Result<(), VectorIndexError> {
        validate_id(id)?;
        self.validate_vector(vector)?;
        if cancel.is_cancelled() {
            return Err(VectorIndexError::Cancelled);
        }

        let start = Instant::now();
        let level = self.random_level();

        let _guard = self.write_lock();
        if cancel.is_cancelled() {
            return Err(VectorIndexError::Cancelled);
        }

        let mut txn = self.txn();
        let replaced = self.unlink_node(&mut txn, id)?;
        self.link_node(&mut txn, id, vector, level)?;
        self.commit(txn)?;

        self.stats.inserts.fetch_add(1, AtomicOrdering::Relaxed);
        if let Ok(mut gauges) = self.stats.gauges.write() {
            gauges.last_insert_time = Some(SystemTime::now());
        }

        debug!(
            "Inserted {} at level {}{} in {:?}",
            id,
            level,
            if replaced { " (replaced)" } else { "" },
            start.elapsed()
        );
        Ok(())
    }

    /// Removes `id` and repairs the neighborhoods it leaves behind.
    ///
    /// Returns whether the id was present; deleting an absent id is not an error.
    #[instrument(skip_all, fields(id = %id))]
    pub fn delete(&self, id: &str) -> Result<bool, VectorIndexError> {
        validate_id(id)?;

        let _guard = self.write_lock();
        let mut txn = self.txn();
        let removed = self.unlink_node(&mut txn, id)?;
        if removed {
            self.commit(txn)?;
            self.stats.deletes.fetch_add(1, AtomicOrdering::Relaxed);
            debug!("Deleted {}", id);
        }
        Ok(removed)
    }

    /// Returns up to `k` nearest vectors, closest first.
    ///
    /// Ties in distance are broken by id.
    #[instrument(skip_all, fields(k))]
    pub fn search(
        &self,
        cancel: &CancellationToken,
        query: &[f64],
        k: usize,
    ) -> Result<Vec<Neighbor>, VectorIndexError> {
        self.validate_vector(query)?;
        if !(1..=MAX_K).contains(&k) {
            return Err(VectorIndexError::InvalidK(k));
        }
        if cancel.is_cancelled() {
            return Err(VectorIndexError::Cancelled);
        }

        let start = Instant::now();
        let _guard = self.read_lock();
        let mut txn = self.txn();
        let entry = txn.entry_point()?.ok_or(VectorIndexError::EmptyIndex)?;

        let mut nearest = vec![Candidate {
            distance: txn.distance(query, &entry.id)?,
            id: entry.id,
        }];
        for layer in (1..=entry.level).rev() {
            if cancel.is_cancelled() {
                return Err(VectorIndexError::Cancelled);
            }
            nearest = self.search_layer(&mut txn, query, nearest, 1, layer)?;
        }
        if cancel.is_cancelled() {
            return Err(VectorIndexError::Cancelled);
        }

        let ef = self.config.ef.max(2 * k);
        let mut results = self.search_layer(&mut txn, query, nearest, ef, 0)?;
        results.truncate(k);

        self.stats.searches.fetch_add(1, AtomicOrdering::Relaxed);
        if let Ok(mut gauges) = self.stats.gauges.write() {
            gauges.last_search_time = Some(SystemTime::now());
        }
        debug!("Search returned {} results in {:?}", results.len(), start.elapsed());

        Ok(results
            .into_iter()
            .map(|c| Neighbor {
                id: c.id,
                distance: c.distance,
            })
            .collect())
    }

    /// Returns the stored vector for `id`.
    pub fn get(&self, id: &str) -> Result<Vec<f64>, VectorIndexError> {
        let _guard = self.read_lock();
        let mut txn = self.txn();
        if txn.level(id)?.is_none() {
            return Err(VectorIndexError::NotFound(id.to_string()));
        }
        Ok(txn.vector(id)?.as_ref().clone())
    }

    pub fn contains(&self, id: &str) -> Result<bool, VectorIndexError> {
        let _guard = self.read_lock();
        Ok(self.txn().level(id)?.is_some())
    }

    /// Number of stored vectors.
    pub fn len(&self) -> u64 {
        self.stats
            .gauges
            .read()
            .map(|g| g.vector_count)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> VectorIndexStats {
        let gauges = match self.stats.gauges.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let total_edges = gauges.adjacency_entries / 2;
        VectorIndexStats {
            vector_count: gauges.vector_count,
            level_count: gauges.entry_level.map_or(0, |l| l + 1),
            total_edges,
            average_degree: if gauges.vector_count == 0 {
                0.0
            } else {
                gauges.adjacency_entries as f64 / gauges.vector_count as f64
            },
            searches_performed: self.stats.searches.load(AtomicOrdering::Relaxed),
            inserts_performed: self.stats.inserts.load(AtomicOrdering::Relaxed),
            deletes_performed: self.stats.deletes.load(AtomicOrdering::Relaxed),
            last_insert_time: gauges.last_insert_time,
            last_search_time: gauges.last_search_time,
        }
    }

    // =========================================================================
    // Graph maintenance
    // =========================================================================

    /// Adds a node and wires it into every layer up to `level`.
    fn link_node(
        &self,
        txn: &mut GraphTxn<'_, S>,
        id: &str,
        vector: &[f64],
        level: usize,
    ) -> Result<(), VectorIndexError> {
        let entry = txn.entry_point()?;
        txn.put_node(id, vector, level)?;

        let Some(entry) = entry else {
            txn.set_entry_point(Some(&EntryPoint {
                id: id.to_string(),
                level,
            }))?;
            return Ok(());
        };

        let mut nearest = vec![Candidate {
            distance: txn.distance(vector, &entry.id)?,
            id: entry.id.clone(),
        }];
        for layer in ((level + 1)..=entry.level).rev() {
            nearest = self.search_layer(txn, vector, nearest, 1, layer)?;
        }

        for layer in (0..=level.min(entry.level)).rev() {
            let candidates = self.search_layer(txn, vector, nearest, self.config.eps, layer)?;
            let selected: Vec<&Candidate> = candidates
                .iter()
                .filter(|c| c.id != id)
                .take(self.config.m)
                .collect();
            for neighbor in selected {
                txn.link(layer, id, &neighbor.id)?;
                self.shrink(txn, layer, &neighbor.id)?;
            }
            nearest = candidates;
        }

        if level > entry.level {
            txn.set_entry_point(Some(&EntryPoint {
                id: id.to_string(),
                level,
            }))?;
        }
        Ok(())
    }

    /// Drops the farthest neighbor of `id` while its list is over capacity.
    ///
    /// A neighbor is only dropped if it keeps at least one other edge on this
    /// layer, so pruning never isolates a node.
    fn shrink(
        &self,
        txn: &mut GraphTxn<'_, S>,
        layer: usize,
        id: &str,
    ) -> Result<(), VectorIndexError> {
        let capacity = self.capacity(layer);
        let neighbors = txn.neighbors(layer, id)?;
        if neighbors.len() <= capacity {
            return Ok(());
        }

        let mut by_distance = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            by_distance.push(Candidate {
                distance: txn.distance_between(id, &neighbor)?,
                id: neighbor,
            });
        }
        by_distance.sort();

        let mut excess = by_distance.len() - capacity;
        for victim in by_distance.iter().rev() {
            if excess == 0 {
                break;
            }
            if txn.neighbors(layer, &victim.id)?.len() > 1 {
                txn.unlink(layer, id, &victim.id)?;
                excess -= 1;
            }
        }
        Ok(())
    }

    /// Removes `id` from the graph. Returns false if it was not present.
    fn unlink_node(&self, txn: &mut GraphTxn<'_, S>, id: &str) -> Result<bool, VectorIndexError> {
        let Some(level) = txn.level(id)? else {
            return Ok(false);
        };

        for layer in 0..=level {
            let former = txn.neighbors(layer, id)?;
            for neighbor in &former {
                txn.unlink(layer, id, neighbor)?;
            }
            self.repair(txn, layer, &former)?;
        }
        txn.remove_node(id)?;

        let entry_removed = txn.entry_point()?.is_some_and(|e| e.id == id);
        if entry_removed {
            let replacement = txn.highest_node()?;
            txn.set_entry_point(replacement.as_ref())?;
        }
        Ok(true)
    }

    /// Reconnects the former neighbors of a deleted node among themselves.
    ///
    /// Each one with spare capacity is linked to its closest former peer that
    /// also has room.
    fn repair(
        &self,
        txn: &mut GraphTxn<'_, S>,
        layer: usize,
        former: &[String],
    ) -> Result<(), VectorIndexError> {
        let capacity = self.capacity(layer);
        for node in former {
            let current = txn.neighbors(layer, node)?;
            if current.len() >= capacity {
                continue;
            }

            let mut best: Option<Candidate> = None;
            for peer in former {
                if peer == node || current.contains(peer) {
                    continue;
                }
                if txn.neighbors(layer, peer)?.len() >= capacity {
                    continue;
                }
                let candidate = Candidate {
                    distance: txn.distance_between(node, peer)?,
                    id: peer.clone(),
                };
                if best.as_ref().is_none_or(|b| candidate < *b) {
                    best = Some(candidate);
                }
            }

            if let Some(peer) = best {
                txn.link(layer, node, &peer.id)?;
            }
        }
        Ok(())
    }

    /// Best-first search of one layer, returning up to `ef` candidates sorted
    /// closest first.
    fn search_layer(
        &self,
        txn: &mut GraphTxn<'_, S>,
        query: &[f64],
        entry_points: Vec<Candidate>,
        ef: usize,
        layer: usize,
    ) -> Result<Vec<Candidate>, VectorIndexError> {
        let mut visited: HashSet<String> = entry_points.iter().map(|c| c.id.clone()).collect();
        let mut frontier: BinaryHeap<Reverse<Candidate>> =
            entry_points.iter().cloned().map(Reverse).collect();
        let mut best: BinaryHeap<Candidate> = entry_points.into_iter().collect();
        while best.len() > ef {
            best.pop();
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if best.len() >= ef && best.peek().is_some_and(|worst| current > *worst) {
                break;
            }

            for neighbor in txn.neighbors(layer, &current.id)? {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let candidate = Candidate {
                    distance: txn.distance(query, &neighbor)?,
                    id: neighbor,
                };
                let admit = best.len() < ef || best.peek().is_some_and(|worst| candidate < *worst);
                if admit {
                    frontier.push(Reverse(candidate.clone()));
                    best.push(candidate);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        Ok(best.into_sorted_vec())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn txn(&self) -> GraphTxn<'_, S> {
        GraphTxn::new(
            &self.store,
            &self.keys,
            self.config.dimension,
            self.config.distance,
        )
    }

    /// Writes the transaction and folds its effect into the gauges.
    fn commit(&self, txn: GraphTxn<'_, S>) -> Result<(), VectorIndexError> {
        let entry_level = txn.entry_point()?.map(|e| e.level);
        let (batch, delta) = txn.into_batch();
        self.store.write(
            batch,
            WriteOptions {
                sync: self.config.sync_writes,
            },
        )?;

        match self.stats.gauges.write() {
            Ok(mut gauges) => {
                gauges.vector_count = gauges.vector_count.saturating_add_signed(delta.vectors);
                gauges.adjacency_entries =
                    gauges.adjacency_entries.saturating_add_signed(delta.adjacency);
                gauges.entry_level = entry_level;
            }
            Err(e) => warn!("Vector index stats lock poisoned: {}", e),
        }
        Ok(())
    }

    /// Maximum neighbors per node: `2m` on layer 0, `m` above.
    fn capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m * 2
        } else {
            self.config.m
        }
    }

    fn random_level(&self) -> usize {
        let sample = match self.rng.lock() {
            Ok(mut rng) => self.level_distribution.sample(&mut *rng),
            Err(poisoned) => self.level_distribution.sample(&mut *poisoned.into_inner()),
        };
        (sample.floor() as usize).min(MAX_LEVEL)
    }

    fn validate_vector(&self, vector: &[f64]) -> Result<(), VectorIndexError> {
        if vector.len() != self.config.dimension {
            return Err(VectorIndexError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        if let Some(pos) = vector.iter().position(|x| !x.is_finite()) {
            return Err(VectorIndexError::InvalidVector(format!(
                "component {} is {}",
                pos, vector[pos]
            )));
        }
        Ok(())
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.graph_lock.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.graph_lock.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_id(id: &str) -> Result<(), VectorIndexError> {
    if id.is_empty() {
        return Err(VectorIndexError::InvalidId("id must not be empty".to_string()));
    }
    if id.len() > MAX_VECTOR_ID_LEN {
        return Err(VectorIndexError::InvalidId(format!(
            "id is {} bytes, maximum is {}",
            id.len(),
            MAX_VECTOR_ID_LEN
        )));
    }
    Ok(())
}
