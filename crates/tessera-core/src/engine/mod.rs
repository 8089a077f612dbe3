//! Hybrid search engine.
//!
//! [`Engine`] owns the text and vector indexes, a bounded index queue with a
//! fixed pool of workers, and the statistics for both paths.
//!
//! # Writes
//!
//! `index`, `update` and `delete` enqueue a task and wait for its outcome.
//! `index` waits up to the configured timeout for room in a full queue;
//! `update` and `delete` fail at once with [`EngineError::QueueFull`].
//! Dropping the returned future abandons the wait but not the task.
//!
//! # Searches
//!
//! Searches run on the blocking pool, never on the index workers. A hybrid
//! query runs both sides concurrently, each with twice the requested window,
//! and fuses them by weighted score. It fails only if both sides fail.
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::new(EngineConfig::default(), text, vector)?;
//! engine
//!     .index(Document::new("a", "t1", DocumentType::Record, "refund policy").with_vector(vec![1.0, 0.0]))
//!     .await?;
//! let results = engine
//!     .search(&CancellationToken::new(), &Query::text("refund").for_tenant("t1"))
//!     .await?;
//! assert_eq!(results.ids(), vec!["a"]);
//! ```

mod fusion;
mod stats;
mod types;
mod worker;

#[cfg(test)]
mod tests;

pub use stats::EngineStats;
pub use types::{Document, DocumentType, Query, QueryType, SearchResults};

use crate::config::{EngineConfig, MAX_K, MAX_SEARCH_LIMIT};
use crate::error::{EngineError, TextIndexError, VectorIndexError};
use crate::storage::KvStore;
use crate::text::{is_valid_tenant_id, InvertedIndex, TextIndexStats};
use crate::vector::{HnswIndex, VectorIndexStats};
use crossbeam_channel::{SendTimeoutError, Sender, TrySendError};
use fusion::Scored;
use stats::StatsInner;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use worker::{IndexTask, TaskKind, WorkerContext, WorkerPool};

/// Hybrid text and vector search over one tenant-partitioned corpus.
///
/// The engine is an explicitly constructed object; several can run side by
/// side without sharing state.
pub struct Engine<S: KvStore + 'static> {
    config: EngineConfig,
    text: Arc<InvertedIndex>,
    vector: Arc<HnswIndex<S>>,
    queue: Sender<IndexTask>,
    pool: Mutex<Option<WorkerPool>>,
    workers: usize,
    closing: AtomicBool,
    /// Cancelled once every worker has exited.
    stopped: CancellationToken,
    next_task_id: AtomicU64,
    stats: Arc<StatsInner>,
}

impl<S: KvStore + 'static> Engine<S> {
    /// Starts the worker pool over the given indexes.
    pub fn new(
        config: EngineConfig,
        text: Arc<InvertedIndex>,
        vector: Arc<HnswIndex<S>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let (queue, tasks) = crossbeam_channel::bounded(config.queue_size);
        let stats = Arc::new(StatsInner::default());
        let pool = WorkerPool::spawn(
            config.workers,
            tasks,
            WorkerContext {
                text: Arc::clone(&text),
                vector: Arc::clone(&vector),
                stats: Arc::clone(&stats),
            },
        )?;

        info!(
            "Engine started ({} workers, queue size {})",
            config.workers, config.queue_size
        );

        Ok(Self {
            workers: pool.len(),
            pool: Mutex::new(Some(pool)),
            config,
            text,
            vector,
            queue,
            closing: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            next_task_id: AtomicU64::new(0),
            stats,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn text_index(&self) -> &Arc<InvertedIndex> {
        &self.text
    }

    pub fn vector_index(&self) -> &Arc<HnswIndex<S>> {
        &self.vector
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Indexes `doc`, replacing any document with the same id.
    ///
    /// Waits up to `enqueue_timeout` for room in the queue, then for the
    /// worker's result.
    pub async fn index(&self, doc: Document) -> Result<(), EngineError> {
        let (task, reply) = self.task(TaskKind::Index(doc));
        self.enqueue_with_timeout(task).await?;
        self.await_reply(reply).await
    }

    /// Replaces `doc` by delete-then-reindex. Fails with `QueueFull` rather
    /// than waiting for room.
    pub async fn update(&self, doc: Document) -> Result<(), EngineError> {
        let (task, reply) = self.task(TaskKind::Update(doc));
        self.try_enqueue(task)?;
        self.await_reply(reply).await
    }

    /// Removes `id` from both indexes. Absent ids are not an error.
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        let (task, reply) = self.task(TaskKind::Delete(id.to_string()));
        self.try_enqueue(task)?;
        self.await_reply(reply).await
    }

    fn task(&self, kind: TaskKind) -> (IndexTask, oneshot::Receiver<Result<(), EngineError>>) {
        let (reply, rx) = oneshot::channel();
        let task = IndexTask {
            id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
            kind,
            enqueued_at: Instant::now(),
            reply,
        };
        (task, rx)
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closing.load(Ordering::Acquire) {
            Err(EngineError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn try_enqueue(&self, task: IndexTask) -> Result<(), EngineError> {
        self.ensure_open()?;
        match self.queue.try_send(task) {
            Ok(()) => {
                self.stats.set_queue_depth(self.queue.len());
                Ok(())
            }
            Err(TrySendError::Full(task)) => {
                debug!("Index queue full, rejecting task {}", task.id);
                Err(EngineError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(EngineError::ShutDown),
        }
    }

    async fn enqueue_with_timeout(&self, task: IndexTask) -> Result<(), EngineError> {
        self.ensure_open()?;
        let task = match self.queue.try_send(task) {
            Ok(()) => {
                self.stats.set_queue_depth(self.queue.len());
                return Ok(());
            }
            Err(TrySendError::Full(task)) => task,
            Err(TrySendError::Disconnected(_)) => return Err(EngineError::ShutDown),
        };

        let timeout = self.config.enqueue_timeout();
        debug!("Index queue full, waiting up to {:?} for room", timeout);
        let queue = self.queue.clone();
        let sent = tokio::task::spawn_blocking(move || queue.send_timeout(task, timeout))
            .await
            .map_err(|e| EngineError::Worker(format!("enqueue task failed: {}", e)))?;

        match sent {
            Ok(()) => {
                self.stats.set_queue_depth(self.queue.len());
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                warn!("Index queue still full after {:?}", timeout);
                Err(EngineError::EnqueueTimeout(timeout))
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(EngineError::ShutDown),
        }
    }

    /// Waits for the worker's answer. Tasks still queued at shutdown are
    /// drained, so `ShutDown` only comes back for tasks no worker will run.
    async fn await_reply(
        &self,
        reply: oneshot::Receiver<Result<(), EngineError>>,
    ) -> Result<(), EngineError> {
        tokio::select! {
            biased;
            result = reply => result.map_err(|_| EngineError::ShutDown)?,
            _ = self.stopped.cancelled() => Err(EngineError::ShutDown),
        }
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Runs `query` and returns one page of ranked documents.
    ///
    /// `limit == 0` takes the configured default; limits above 10000 are
    /// rejected. `offset` is applied after ranking.
    #[instrument(skip_all, fields(kind = ?query.query_type, tenant = %query.tenant_id))]
    pub async fn search(
        &self,
        cancel: &CancellationToken,
        query: &Query,
    ) -> Result<SearchResults, EngineError> {
        self.ensure_open()?;
        let limit = self.resolve_limit(query.limit)?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let start = Instant::now();
        let window = limit.saturating_add(query.offset).min(MAX_SEARCH_LIMIT);
        let ranked = match query.query_type {
            QueryType::FullText => self.text_ranked(cancel, query, window).await?,
            QueryType::Vector => self.vector_ranked(cancel, query, window).await?,
            QueryType::Hybrid => self.hybrid_ranked(cancel, query, window).await?,
            QueryType::Structured => {
                return Err(EngineError::NotImplemented("structured queries"))
            }
        };

        let total = ranked.len();
        let (documents, scores): (Vec<Document>, Vec<f64>) =
            ranked.into_iter().skip(query.offset).take(limit).unzip();
        let query_time = start.elapsed();
        self.stats.record_search(query_time);

        debug!(
            "Search returned {} of {} results in {:?}",
            documents.len(),
            total,
            query_time
        );
        Ok(SearchResults {
            documents,
            scores,
            total,
            query_time,
        })
    }

    fn resolve_limit(&self, limit: usize) -> Result<usize, EngineError> {
        match limit {
            0 => Ok(self.config.default_limit),
            l if l > MAX_SEARCH_LIMIT => Err(EngineError::InvalidQuery(format!(
                "limit {} exceeds {}",
                l, MAX_SEARCH_LIMIT
            ))),
            l => Ok(l),
        }
    }

    async fn text_ranked(
        &self,
        cancel: &CancellationToken,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<Scored>, EngineError> {
        let text = Arc::clone(&self.text);
        let token = cancel.clone();
        let terms = query.text.clone();
        let tenant = query.tenant_id.clone();

        run_blocking(cancel, move || {
            let hits = text
                .search(&token, &terms, &tenant, limit)
                .map_err(from_text_error)?;
            hits.documents
                .into_iter()
                .zip(hits.scores)
                .map(|(doc, score)| Ok::<_, EngineError>((Document::try_from(doc)?, score)))
                .collect()
        })
        .await
    }

    /// Nearest vectors, hydrated into documents through the text index.
    ///
    /// Hydration is tenant-scoped; a hit with no document for the tenant is
    /// dropped.
    async fn vector_ranked(
        &self,
        cancel: &CancellationToken,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<Scored>, EngineError> {
        let vector = match &query.vector {
            Some(v) if !v.is_empty() => v.clone(),
            _ => {
                return Err(EngineError::InvalidQuery(
                    "vector search requires a query vector".to_string(),
                ))
            }
        };
        let tenant = match query.tenant_id.as_str() {
            "" => None,
            t if is_valid_tenant_id(t) => Some(t.to_string()),
            t => return Err(TextIndexError::InvalidTenant(t.to_string()).into()),
        };

        let index = Arc::clone(&self.vector);
        let text = Arc::clone(&self.text);
        let token = cancel.clone();
        let k = limit.min(MAX_K);

        run_blocking(cancel, move || {
            let neighbors = index
                .search(&token, &vector, k)
                .map_err(from_vector_error)?;
            let metric = index.config().distance;

            let mut ranked = Vec::with_capacity(neighbors.len());
            for neighbor in neighbors {
                match text.document(&neighbor.id, tenant.as_deref()) {
                    Ok(doc) => {
                        ranked.push((Document::try_from(doc)?, metric.similarity(neighbor.distance)))
                    }
                    Err(TextIndexError::NotFound(_)) => {
                        debug!("Dropping vector hit {} with no document", neighbor.id);
                    }
                    Err(e) => return Err(from_text_error(e)),
                }
            }
            Ok(ranked)
        })
        .await
    }

    async fn hybrid_ranked(
        &self,
        cancel: &CancellationToken,
        query: &Query,
        limit: usize,
    ) -> Result<Vec<Scored>, EngineError> {
        let wide = limit.saturating_mul(2).min(MAX_SEARCH_LIMIT);
        let (text, vector) = tokio::join!(
            self.text_ranked(cancel, query, wide),
            self.vector_ranked(cancel, query, wide)
        );
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let (text, vector) = match (text, vector) {
            (Ok(text), Ok(vector)) => (text, vector),
            (Ok(text), Err(e)) => {
                debug!("Hybrid search continuing without vector results: {}", e);
                (text, Vec::new())
            }
            (Err(e), Ok(vector)) => {
                debug!("Hybrid search continuing without text results: {}", e);
                (Vec::new(), vector)
            }
            (Err(text), Err(vector)) => {
                return Err(EngineError::HybridFailed {
                    text: Box::new(text),
                    vector: Box::new(vector),
                })
            }
        };

        Ok(fusion::fuse(
            text,
            vector,
            self.config.text_weight,
            self.config.vector_weight,
        ))
    }

    // =========================================================================
    // Read-through helpers
    // =========================================================================

    /// Fetches one document with its vector, optionally scoped to a tenant.
    pub async fn document(
        &self,
        id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Document, EngineError> {
        let text = Arc::clone(&self.text);
        let vector = Arc::clone(&self.vector);
        let id = id.to_string();
        let tenant = tenant_id.map(str::to_string);

        run_blocking(&CancellationToken::new(), move || {
            let mut doc = Document::try_from(text.document(&id, tenant.as_deref())?)?;
            match vector.get(&id) {
                Ok(v) => doc.vector = Some(v),
                Err(VectorIndexError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            Ok(doc)
        })
        .await
    }

    /// Lists a tenant's documents, most recently indexed first.
    pub async fn tenant_documents(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Document>, EngineError> {
        let limit = self.resolve_limit(limit)?;
        let text = Arc::clone(&self.text);
        let tenant = tenant_id.to_string();

        run_blocking(&CancellationToken::new(), move || {
            text.documents_by_tenant(&tenant, limit, offset)?
                .into_iter()
                .map(Document::try_from)
                .collect()
        })
        .await
    }

    /// Thread-safe snapshot of the engine counters and gauges.
    pub fn stats(&self) -> EngineStats {
        self.stats.set_queue_depth(self.queue.len());
        self.stats.snapshot(self.workers)
    }

    pub async fn text_stats(&self) -> Result<TextIndexStats, EngineError> {
        let text = Arc::clone(&self.text);
        run_blocking(&CancellationToken::new(), move || Ok(text.stats()?)).await
    }

    pub fn vector_stats(&self) -> VectorIndexStats {
        self.vector.stats()
    }

    /// Merges text index segments.
    pub async fn optimize(&self) -> Result<(), EngineError> {
        let text = Arc::clone(&self.text);
        run_blocking(&CancellationToken::new(), move || Ok(text.optimize()?)).await
    }

    /// Drops and recreates the text index tables, discarding every text
    /// document. Vectors are kept but no longer hydrate until re-indexed.
    ///
    /// Not safe alongside queued writes; callers run it on an idle engine.
    pub async fn rebuild_text(&self) -> Result<(), EngineError> {
        let text = Arc::clone(&self.text);
        run_blocking(&CancellationToken::new(), move || Ok(text.rebuild()?)).await
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops accepting work, lets the workers drain the queue and waits for
    /// them to exit. Later calls return immediately.
    ///
    /// The indexes stay open; they may be shared beyond this engine.
    pub async fn close(&self) -> Result<(), EngineError> {
        let pool = match self.pool.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut pool) = pool else {
            return Ok(());
        };

        self.closing.store(true, Ordering::Release);
        info!("Shutting down engine, draining {} queued tasks", self.queue.len());

        let joined = tokio::task::spawn_blocking(move || pool.shutdown()).await;
        self.stopped.cancel();
        joined.map_err(|e| EngineError::Worker(format!("shutdown task failed: {}", e)))?
    }
}

/// Runs blocking index work on the blocking pool, returning early with
/// `Cancelled` if `cancel` fires first.
async fn run_blocking<T, F>(cancel: &CancellationToken, f: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        joined = handle => joined
            .map_err(|e| EngineError::Worker(format!("blocking task failed: {}", e)))?,
    }
}

fn from_text_error(e: TextIndexError) -> EngineError {
    match e {
        TextIndexError::Cancelled => EngineError::Cancelled,
        other => other.into(),
    }
}

fn from_vector_error(e: VectorIndexError) -> EngineError {
    match e {
        VectorIndexError::Cancelled => EngineError::Cancelled,
        other => other.into(),
    }
}
