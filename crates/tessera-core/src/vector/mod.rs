//! Approximate nearest-neighbor search.
//!
//! [`HnswIndex`] keeps its whole graph (vectors, per-layer adjacency, entry
//! point) in a [`KvStore`](crate::storage::KvStore), so it is as durable as
//! the store it is opened on.

mod graph;
mod hnsw;

pub use hnsw::{HnswIndex, Neighbor, VectorIndexStats};
