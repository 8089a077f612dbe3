//! Configuration for the indexes and the engine.
//!
//! Defaults and accepted bounds are collected here so that the indexes, the
//! engine, the CLI and the benchmarks agree on them. Every config struct
//! deserializes with serde (missing fields take their defaults) and exposes a
//! `validate()` that construction calls before touching storage.
//!
//! # Usage
//!
//! ```
//! use tessera_core::config::{EngineConfig, VectorIndexConfig};
//!
//! let vector = VectorIndexConfig {
//!     dimension: 384,
//!     ..VectorIndexConfig::default()
//! };
//! assert!(vector.validate().is_ok());
//! assert_eq!(EngineConfig::default().workers, 4);
//! ```

use crate::distance::DistanceType;
use crate::error::{EngineError, TextIndexError, VectorIndexError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Inverted Index
// =============================================================================

/// Default table prefix; tables are `{prefix}_fts` and `{prefix}_meta`.
pub const DEFAULT_TABLE_PREFIX: &str = "search";

/// FTS5 base tokenizers accepted in `TextIndexConfig::tokenizer`, alone or
/// wrapped by `porter`.
pub const TOKENIZERS: [&str; 2] = ["unicode61", "ascii"];

/// Default FTS5 tokenizer specification.
pub const DEFAULT_TOKENIZER: &str = "unicode61 remove_diacritics 1";

/// Maximum table prefix length.
pub const MAX_TABLE_PREFIX_LEN: usize = 64;

/// Queries longer than this many characters are truncated, not rejected.
pub const MAX_QUERY_CHARS: usize = 1000;

/// Maximum number of terms kept from one query.
pub const MAX_QUERY_TERMS: usize = 20;

/// Terms longer than this many characters are skipped.
pub const MAX_TERM_CHARS: usize = 100;

/// Maximum tenant id length.
pub const MAX_TENANT_ID_LEN: usize = 64;

/// Upper bound for search and listing limits.
pub const MAX_SEARCH_LIMIT: usize = 10_000;

// =============================================================================
// Vector Index
// =============================================================================

/// Default vector dimension.
pub const DEFAULT_DIMENSION: usize = 768;

/// Default maximum neighbors per node per upper layer (layer 0 allows twice this).
pub const DEFAULT_M: usize = 16;

/// Default search breadth.
pub const DEFAULT_EF: usize = 200;

/// Default construction breadth.
pub const DEFAULT_EPS: usize = 200;

/// Default level multiplier, `1 / ln(2)`.
pub const DEFAULT_ML: f64 = std::f64::consts::LOG2_E;

/// Default key namespace for the vector graph.
pub const DEFAULT_VECTOR_PREFIX: &str = "vector:";

/// Hard ceiling on node levels regardless of `ml`.
pub const MAX_LEVEL: usize = 32;

pub const MAX_DIMENSION: usize = 10_000;
pub const MAX_M: usize = 100;
pub const MAX_EF: usize = 1000;
pub const MAX_EPS: usize = 1000;
pub const MAX_ML: f64 = 10.0;

/// Maximum vector id length in bytes.
pub const MAX_VECTOR_ID_LEN: usize = 256;

/// Maximum `k` for a single vector search.
pub const MAX_K: usize = 1000;

// =============================================================================
// Engine
// =============================================================================

/// Default number of index workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Default index queue capacity.
pub const DEFAULT_QUEUE_SIZE: usize = 1000;

/// How long `Engine::index` waits for room in a full queue, in milliseconds.
pub const DEFAULT_ENQUEUE_TIMEOUT_MS: u64 = 5_000;

/// Default weight of the text score in hybrid fusion.
pub const DEFAULT_TEXT_WEIGHT: f64 = 0.6;

/// Default weight of the vector score in hybrid fusion.
pub const DEFAULT_VECTOR_WEIGHT: f64 = 0.4;

/// Result count used when a query leaves `limit` at zero.
pub const DEFAULT_RESULT_LIMIT: usize = 10;

/// Settings for the SQLite FTS5 inverted index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextIndexConfig {
    /// Prefix for the `{prefix}_fts` and `{prefix}_meta` tables.
    pub table_prefix: String,
    /// FTS5 `tokenize=` argument.
    pub tokenizer: String,
}

impl Default for TextIndexConfig {
    fn default() -> Self {
        Self {
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            tokenizer: DEFAULT_TOKENIZER.to_string(),
        }
    }
}

impl TextIndexConfig {
    /// Checks the prefix and tokenizer before they are spliced into DDL.
    pub fn validate(&self) -> Result<(), TextIndexError> {
        let prefix = &self.table_prefix;
        if prefix.is_empty() || prefix.len() > MAX_TABLE_PREFIX_LEN {
            return Err(TextIndexError::InvalidConfig(format!(
                "table prefix must be 1-{} characters",
                MAX_TABLE_PREFIX_LEN
            )));
        }
        if !prefix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(TextIndexError::InvalidConfig(format!(
                "table prefix {:?} may only contain letters, digits and '_'",
                prefix
            )));
        }

        // Tokenizer goes into a quoted DDL literal: allow only words, digits and spaces.
        let mut words = self.tokenizer.split_whitespace();
        let mut name = words.next().unwrap_or_default();
        if name == "porter" {
            // porter wraps another tokenizer, unicode61 when none is named
            name = words.next().unwrap_or("unicode61");
        }
        // trigram is excluded: it emits no token for tenant ids under 3 chars
        if !TOKENIZERS.contains(&name) {
            return Err(TextIndexError::InvalidConfig(format!(
                "unsupported tokenizer {:?}",
                self.tokenizer
            )));
        }
        if !words.all(|w| w.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')) {
            return Err(TextIndexError::InvalidConfig(format!(
                "invalid tokenizer arguments in {:?}",
                self.tokenizer
            )));
        }
        Ok(())
    }
}

/// Parameters of an HNSW vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorIndexConfig {
    /// Exact length of every inserted and queried vector.
    pub dimension: usize,
    /// Distance metric.
    pub distance: DistanceType,
    /// Maximum neighbors per node on upper layers.
    pub m: usize,
    /// Search breadth at layer 0.
    pub ef: usize,
    /// Level multiplier; expected height grows with `ml * ln(n)`.
    pub ml: f64,
    /// Construction breadth.
    pub eps: usize,
    /// Key namespace within the store.
    pub prefix: String,
    /// Fixed RNG seed for level assignment (reproducible graphs in tests).
    pub seed: Option<u64>,
    /// Fsync every graph mutation.
    pub sync_writes: bool,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            distance: DistanceType::Cosine,
            m: DEFAULT_M,
            ef: DEFAULT_EF,
            ml: DEFAULT_ML,
            eps: DEFAULT_EPS,
            prefix: DEFAULT_VECTOR_PREFIX.to_string(),
            seed: None,
            sync_writes: false,
        }
    }
}

impl VectorIndexConfig {
    /// Rejects out-of-range parameters; index creation fails outright on error.
    pub fn validate(&self) -> Result<(), VectorIndexError> {
        fn check(ok: bool, msg: String) -> Result<(), VectorIndexError> {
            if ok {
                Ok(())
            } else {
                Err(VectorIndexError::InvalidConfig(msg))
            }
        }

        check(
            (1..=MAX_DIMENSION).contains(&self.dimension),
            format!("dimension {} not in 1..={}", self.dimension, MAX_DIMENSION),
        )?;
        check(
            (1..=MAX_M).contains(&self.m),
            format!("m {} not in 1..={}", self.m, MAX_M),
        )?;
        check(
            (1..=MAX_EF).contains(&self.ef),
            format!("ef {} not in 1..={}", self.ef, MAX_EF),
        )?;
        check(
            (1..=MAX_EPS).contains(&self.eps),
            format!("eps {} not in 1..={}", self.eps, MAX_EPS),
        )?;
        check(
            self.ml > 0.0 && self.ml <= MAX_ML,
            format!("ml {} not in (0, {}]", self.ml, MAX_ML),
        )?;
        check(!self.prefix.is_empty(), "prefix must not be empty".to_string())
    }
}

/// Settings for the hybrid engine's worker pool and fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of long-lived index workers.
    pub workers: usize,
    /// Capacity of the shared index queue.
    pub queue_size: usize,
    /// Weight applied to text scores in hybrid fusion.
    pub text_weight: f64,
    /// Weight applied to vector scores in hybrid fusion.
    pub vector_weight: f64,
    /// Limit used when a query does not set one.
    pub default_limit: usize,
    /// How long `index` waits for room in a full queue before giving up.
    pub enqueue_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_size: DEFAULT_QUEUE_SIZE,
            text_weight: DEFAULT_TEXT_WEIGHT,
            vector_weight: DEFAULT_VECTOR_WEIGHT,
            default_limit: DEFAULT_RESULT_LIMIT,
            enqueue_timeout_ms: DEFAULT_ENQUEUE_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.queue_size == 0 {
            return Err(EngineError::InvalidConfig(
                "queue_size must be at least 1".to_string(),
            ));
        }
        let weights_ok = |w: f64| w.is_finite() && w >= 0.0;
        if !weights_ok(self.text_weight) || !weights_ok(self.vector_weight) {
            return Err(EngineError::InvalidConfig(format!(
                "fusion weights must be finite and non-negative (text {}, vector {})",
                self.text_weight, self.vector_weight
            )));
        }
        if !(1..=MAX_SEARCH_LIMIT).contains(&self.default_limit) {
            return Err(EngineError::InvalidConfig(format!(
                "default_limit {} not in 1..={}",
                self.default_limit, MAX_SEARCH_LIMIT
            )));
        }
        Ok(())
    }
}
