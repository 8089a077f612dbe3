//! Error types for tessera-core.
//!
//! Each subsystem has its own error enum. Validation errors are returned before
//! any mutation, storage errors carry the failing operation in their message,
//! and the engine layers the index errors underneath its own conditions.

use crate::storage::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Errors from the fixed-width vector codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Byte buffer does not hold exactly `dimension` components
    #[error("Invalid vector byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Errors that can occur in the inverted (full-text) index.
#[derive(Debug, Clone, Error)]
pub enum TextIndexError {
    /// Table prefix or tokenizer rejected at construction
    #[error("Invalid text index configuration: {0}")]
    InvalidConfig(String),
    /// Tenant id does not match the identifier pattern
    #[error("Invalid tenant id: {0:?}")]
    InvalidTenant(String),
    /// Search or listing limit outside the accepted range
    #[error("Invalid limit {0}: must be between 1 and 10000")]
    InvalidLimit(usize),
    /// Query text is empty or whitespace only
    #[error("Empty query")]
    EmptyQuery,
    /// Document id is empty
    #[error("Invalid document id: {0}")]
    InvalidDocument(String),
    /// Document not present (or not visible to the tenant)
    #[error("Document not found: {0}")]
    NotFound(String),
    /// SQLite failure, wrapped with the failing operation
    #[error("Database error: {0}")]
    Database(String),
    /// Stored metadata could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Index was closed
    #[error("Text index is closed")]
    Closed,
    /// Caller cancelled the operation
    #[error("Text search cancelled")]
    Cancelled,
}

/// Errors that can occur in the HNSW vector index.
#[derive(Debug, Clone, Error)]
pub enum VectorIndexError {
    /// Parameters outside their accepted bounds
    #[error("Invalid vector index configuration: {0}")]
    InvalidConfig(String),
    /// Vector id empty or too long
    #[error("Invalid vector id: {0}")]
    InvalidId(String),
    /// Vector length differs from the configured dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// Vector contains NaN or infinite components
    #[error("Invalid vector: {0}")]
    InvalidVector(String),
    /// Requested neighbor count outside the accepted range
    #[error("Invalid k {0}: must be between 1 and 1000")]
    InvalidK(usize),
    /// Search issued against a graph with no vectors
    #[error("Vector index is empty")]
    EmptyIndex,
    /// Vector id not present
    #[error("Vector not found: {0}")]
    NotFound(String),
    /// Graph references a node whose data is missing or unreadable
    #[error("Vector index corrupted: {0}")]
    Corrupted(String),
    /// Caller cancelled the operation
    #[error("Vector operation cancelled")]
    Cancelled,
    /// Underlying key-value store failure
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Errors returned by the hybrid [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Non-blocking enqueue found the queue at capacity
    #[error("Index queue full")]
    QueueFull,
    /// Blocking enqueue did not find room in time
    #[error("Timed out after {0:?} waiting for room in the index queue")]
    EnqueueTimeout(Duration),
    /// Caller cancelled the wait or the search
    #[error("Operation cancelled")]
    Cancelled,
    /// Engine closed before the task could be accepted or answered
    #[error("Engine is shut down")]
    ShutDown,
    /// Malformed query or document
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    /// Engine parameters outside their accepted bounds
    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),
    /// Query type reserved but unsupported
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("Text index: {0}")]
    Text(#[from] TextIndexError),
    #[error("Vector index: {0}")]
    Vector(#[from] VectorIndexError),
    /// Text write succeeded but the vector write failed
    #[error("Vector write failed for {id} after text write (text entry compensated: {compensated}): {source}")]
    PartialWrite {
        id: String,
        compensated: bool,
        #[source]
        source: VectorIndexError,
    },
    /// Hybrid search where neither side produced results
    #[error("Hybrid search failed: text: {text}; vector: {vector}")]
    HybridFailed {
        text: Box<EngineError>,
        vector: Box<EngineError>,
    },
    /// Blocking task panicked or was aborted
    #[error("Worker failure: {0}")]
    Worker(String),
}

impl EngineError {
    /// True for conditions caused by the caller rather than the engine.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidQuery(_)
                | EngineError::Text(TextIndexError::InvalidTenant(_))
                | EngineError::Text(TextIndexError::InvalidLimit(_))
                | EngineError::Text(TextIndexError::EmptyQuery)
                | EngineError::Vector(VectorIndexError::DimensionMismatch { .. })
                | EngineError::Vector(VectorIndexError::InvalidVector(_))
                | EngineError::Vector(VectorIndexError::InvalidId(_))
                | EngineError::Vector(VectorIndexError::InvalidK(_))
        )
    }
}
