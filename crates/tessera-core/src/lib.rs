//! # Tessera Core
//!
//! Multi-tenant hybrid search: a SQLite FTS5 inverted index, an HNSW vector
//! index persisted in a sorted key-value store, and an engine that queues
//! writes onto a worker pool and fuses text and vector rankings.
//!
//! ## Modules
//!
//! - [`text`] - FTS5 inverted index with tenant scoping and safe query building
//! - [`vector`] - HNSW graph stored under one key prefix of a [`storage::KvStore`]
//! - [`engine`] - Worker queue, search dispatch and weighted-sum fusion
//! - [`storage`] - Key-value store trait, in-memory and redb implementations
//! - [`distance`] - Distance metrics and the vector wire format
//! - [`config`] - Configuration structs and limits
//! - [`error`] - Error types for every layer

pub mod config;
pub mod distance;
pub mod engine;
pub mod error;
pub mod storage;
pub mod text;
pub mod vector;

pub use config::{EngineConfig, TextIndexConfig, VectorIndexConfig};
pub use distance::DistanceType;
pub use engine::{Document, DocumentType, Engine, EngineStats, Query, QueryType, SearchResults};
pub use error::{EngineError, TextIndexError, VectorIndexError};
pub use text::InvertedIndex;
pub use vector::HnswIndex;

/// Cancellation token accepted by every search.
pub use tokio_util::sync::CancellationToken;
