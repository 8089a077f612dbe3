//! Index workers.
//!
//! A fixed set of named OS threads drains one shared bounded queue. Each task
//! is taken by exactly one worker, executed once, and its outcome sent on the
//! task's oneshot; a waiter that has gone away simply misses the reply.
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │   Callers   │────▶│  Bounded queue   │────▶│ index-worker-0..N│
//! │ (async fns) │     │ (crossbeam MPMC) │     │  (OS threads)    │
//! └─────────────┘     └──────────────────┘     └──────────────────┘
//!        ▲                                              │
//!        └────────────── oneshot reply ◀────────────────┘
//! ```
//!
//! Shutdown drops the sender of a separate zero-capacity channel. Every
//! worker sees the disconnect, drains whatever is still queued and exits.

use super::stats::{StatsInner, WriteOutcome};
use super::types::Document;
use crate::config::MAX_VECTOR_ID_LEN;
use crate::error::{EngineError, VectorIndexError};
use crate::storage::KvStore;
use crate::text::{is_valid_tenant_id, InvertedIndex};
use crate::vector::HnswIndex;
use crossbeam_channel::{select, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Work carried by an [`IndexTask`].
#[derive(Debug)]
pub(crate) enum TaskKind {
    Index(Document),
    Update(Document),
    Delete(String),
}

impl TaskKind {
    fn name(&self) -> &'static str {
        match self {
            TaskKind::Index(_) => "index",
            TaskKind::Update(_) => "update",
            TaskKind::Delete(_) => "delete",
        }
    }

    fn document_id(&self) -> &str {
        match self {
            TaskKind::Index(doc) | TaskKind::Update(doc) => &doc.id,
            TaskKind::Delete(id) => id,
        }
    }
}

pub(crate) type TaskReply = oneshot::Sender<Result<(), EngineError>>;

/// One unit of queued work.
pub(crate) struct IndexTask {
    pub id: u64,
    pub kind: TaskKind,
    pub enqueued_at: Instant,
    pub reply: TaskReply,
}

/// Everything a worker needs to execute tasks.
pub(crate) struct WorkerContext<S: KvStore> {
    pub text: Arc<InvertedIndex>,
    pub vector: Arc<HnswIndex<S>>,
    pub stats: Arc<StatsInner>,
}

impl<S: KvStore> Clone for WorkerContext<S> {
    fn clone(&self) -> Self {
        Self {
            text: Arc::clone(&self.text),
            vector: Arc::clone(&self.vector),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<S: KvStore> WorkerContext<S> {
    #[instrument(skip_all, fields(task = task.id, kind = task.kind.name(), doc = %task.kind.document_id()))]
    fn execute(&self, task: IndexTask, queue_depth: usize) {
        let waited = task.enqueued_at.elapsed();
        let result = match &task.kind {
            TaskKind::Index(doc) => self.index_document(doc),
            TaskKind::Update(doc) => self.update_document(doc),
            TaskKind::Delete(id) => self.delete_document(id).map(|_| WriteOutcome::Deleted),
        };

        match &result {
            Ok(outcome) => {
                self.stats.record_write(*outcome, queue_depth);
                debug!("Task completed (queued {:?})", waited);
            }
            Err(e) if e.is_validation() => {
                self.stats.record_failure(queue_depth);
                debug!("Task rejected: {}", e);
            }
            Err(e) => {
                self.stats.record_failure(queue_depth);
                warn!("Task failed: {}", e);
            }
        }

        if task.reply.send(result.map(|_| ())).is_err() {
            debug!("Waiter gone before task {} finished", task.id);
        }
    }

    /// Writes the text entry, then the vector if present.
    ///
    /// A failed vector write removes the text entry again so the document is
    /// not half-indexed.
    fn index_document(&self, doc: &Document) -> Result<WriteOutcome, EngineError> {
        self.validate_document(doc)?;
        self.text.index(&doc.to_text())?;

        let vector_result = match &doc.vector {
            Some(vector) => self.vector.insert(&CancellationToken::new(), &doc.id, vector),
            // A replacement without a vector must not leave the old one searchable
            None => self.vector.delete(&doc.id).map(|_| ()),
        };

        match vector_result {
            Ok(()) => Ok(WriteOutcome::Indexed {
                vector: doc.vector.is_some(),
            }),
            Err(source) => Err(self.compensate(&doc.id, source)),
        }
    }

    /// Delete-then-reindex. Validation runs first so a bad update leaves the
    /// old document in place.
    fn update_document(&self, doc: &Document) -> Result<WriteOutcome, EngineError> {
        self.validate_document(doc)?;
        self.delete_document(&doc.id)?;
        self.index_document(doc)
    }

    fn validate_document(&self, doc: &Document) -> Result<(), EngineError> {
        validate_id(&doc.id)?;
        if !is_valid_tenant_id(&doc.tenant_id) {
            return Err(EngineError::InvalidQuery(format!(
                "invalid tenant id {:?}",
                doc.tenant_id
            )));
        }
        if let Some(vector) = &doc.vector {
            self.vector.validate(&doc.id, vector)?;
        }
        Ok(())
    }

    fn compensate(&self, id: &str, source: VectorIndexError) -> EngineError {
        let compensated = match self.text.delete(id) {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to remove text entry for {} after vector failure: {}", id, e);
                false
            }
        };
        warn!(
            "Vector write for {} failed (text entry removed: {}): {}",
            id, compensated, source
        );
        EngineError::PartialWrite {
            id: id.to_string(),
            compensated,
            source,
        }
    }

    fn delete_document(&self, id: &str) -> Result<(), EngineError> {
        validate_id(id)?;
        let text_removed = self.text.delete(id)?;
        let vector_removed = self.vector.delete(id)?;
        debug!(
            "Deleted {} (text: {}, vector: {})",
            id, text_removed, vector_removed
        );
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<(), EngineError> {
    if id.is_empty() {
        return Err(EngineError::InvalidQuery(
            "document id must not be empty".to_string(),
        ));
    }
    if id.len() > MAX_VECTOR_ID_LEN {
        return Err(EngineError::InvalidQuery(format!(
            "document id is {} bytes, maximum is {}",
            id.len(),
            MAX_VECTOR_ID_LEN
        )));
    }
    Ok(())
}

/// Handles of the running workers.
pub(crate) struct WorkerPool {
    shutdown: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `count` workers reading from `tasks`.
    pub fn spawn<S: KvStore + 'static>(
        count: usize,
        tasks: Receiver<IndexTask>,
        context: WorkerContext<S>,
    ) -> Result<Self, EngineError> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let mut pool = Self {
            shutdown: Some(shutdown_tx),
            handles: Vec::with_capacity(count),
        };

        for worker_id in 0..count {
            let tasks = tasks.clone();
            let shutdown = shutdown_rx.clone();
            let context = context.clone();
            let handle = thread::Builder::new()
                .name(format!("index-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, tasks, shutdown, context))
                .map_err(|e| EngineError::Worker(format!("failed to spawn worker: {}", e)));

            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    // Stop the workers that did start before reporting
                    let _ = pool.shutdown();
                    return Err(e);
                }
            }
        }

        info!("Started {} index workers", count);
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Signals every worker to drain and exit, then waits for them.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        self.shutdown.take();

        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("index-worker").to_string();
            if handle.join().is_err() {
                error!("{} panicked", name);
                panicked += 1;
            }
        }

        if panicked > 0 {
            return Err(EngineError::Worker(format!(
                "{} worker(s) panicked",
                panicked
            )));
        }
        info!("All index workers stopped");
        Ok(())
    }
}

fn worker_loop<S: KvStore>(
    worker_id: usize,
    tasks: Receiver<IndexTask>,
    shutdown: Receiver<()>,
    context: WorkerContext<S>,
) {
    debug!("Index worker {} started", worker_id);

    loop {
        select! {
            recv(tasks) -> task => match task {
                Ok(task) => context.execute(task, tasks.len()),
                Err(_) => break,
            },
            recv(shutdown) -> _ => {
                let mut drained = 0;
                while let Ok(task) = tasks.try_recv() {
                    context.execute(task, tasks.len());
                    drained += 1;
                }
                if drained > 0 {
                    debug!("Index worker {} drained {} tasks", worker_id, drained);
                }
                break;
            }
        }
    }

    debug!("Index worker {} stopped", worker_id);
}
