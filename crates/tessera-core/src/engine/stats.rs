//! Engine statistics.
//!
//! Counters are atomics so workers can bump them without contention. Gauges
//! sit behind one lock, and every counter that accompanies a gauge change is
//! bumped inside that critical section; a snapshot taken under the same lock
//! therefore never pairs a counter with a gauge from a different moment.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

/// Point-in-time snapshot returned by [`Engine::stats`](super::Engine::stats).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    /// Successful `index` and `update` tasks.
    pub documents_indexed: u64,
    pub documents_deleted: u64,
    /// Vectors written to the vector index.
    pub vector_inserts: u64,
    pub tasks_failed: u64,
    pub searches_performed: u64,
    /// Tasks waiting in the index queue when last observed.
    pub queue_depth: usize,
    /// Mean wall time of successful searches.
    pub average_query_time: Duration,
    pub last_index_time: Option<SystemTime>,
    pub last_query_time: Option<SystemTime>,
    pub workers: usize,
}

/// What a completed task changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Indexed { vector: bool },
    Deleted,
}

#[derive(Debug, Default)]
struct Gauges {
    queue_depth: usize,
    total_query_time: Duration,
    last_index_time: Option<SystemTime>,
    last_query_time: Option<SystemTime>,
}

#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    documents_indexed: AtomicU64,
    documents_deleted: AtomicU64,
    vector_inserts: AtomicU64,
    tasks_failed: AtomicU64,
    searches: AtomicU64,
    gauges: RwLock<Gauges>,
}

impl StatsInner {
    fn gauges(&self) -> RwLockReadGuard<'_, Gauges> {
        self.gauges.read().unwrap_or_else(|e| e.into_inner())
    }

    fn gauges_mut(&self) -> RwLockWriteGuard<'_, Gauges> {
        self.gauges.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_write(&self, outcome: WriteOutcome, queue_depth: usize) {
        let mut gauges = self.gauges_mut();
        match outcome {
            WriteOutcome::Indexed { vector } => {
                self.documents_indexed.fetch_add(1, Ordering::Relaxed);
                if vector {
                    self.vector_inserts.fetch_add(1, Ordering::Relaxed);
                }
            }
            WriteOutcome::Deleted => {
                self.documents_deleted.fetch_add(1, Ordering::Relaxed);
            }
        }
        gauges.queue_depth = queue_depth;
        gauges.last_index_time = Some(SystemTime::now());
    }

    pub fn record_failure(&self, queue_depth: usize) {
        let mut gauges = self.gauges_mut();
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        gauges.queue_depth = queue_depth;
    }

    pub fn record_search(&self, elapsed: Duration) {
        let mut gauges = self.gauges_mut();
        self.searches.fetch_add(1, Ordering::Relaxed);
        gauges.total_query_time += elapsed;
        gauges.last_query_time = Some(SystemTime::now());
    }

    pub fn set_queue_depth(&self, queue_depth: usize) {
        self.gauges_mut().queue_depth = queue_depth;
    }

    pub fn snapshot(&self, workers: usize) -> EngineStats {
        let gauges = self.gauges();
        let searches = self.searches.load(Ordering::Relaxed);
        let average_query_time = if searches == 0 {
            Duration::ZERO
        } else {
            gauges.total_query_time.div_f64(searches as f64)
        };

        EngineStats {
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            documents_deleted: self.documents_deleted.load(Ordering::Relaxed),
            vector_inserts: self.vector_inserts.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            searches_performed: searches,
            queue_depth: gauges.queue_depth,
            average_query_time,
            last_index_time: gauges.last_index_time,
            last_query_time: gauges.last_query_time,
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_average_query_time() {
        let stats = StatsInner::default();
        assert_eq!(stats.snapshot(1).average_query_time, Duration::ZERO);

        stats.record_search(Duration::from_millis(10));
        stats.record_search(Duration::from_millis(30));
        let snapshot = stats.snapshot(1);
        assert_eq!(snapshot.searches_performed, 2);
        assert_eq!(snapshot.average_query_time, Duration::from_millis(20));
        assert!(snapshot.last_query_time.is_some());
    }

    #[test]
    fn test_concurrent_counters() {
        let stats = Arc::new(StatsInner::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record_write(WriteOutcome::Indexed { vector: true }, 0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot(4);
        assert_eq!(snapshot.documents_indexed, 1000);
        assert_eq!(snapshot.vector_inserts, 1000);
        assert_eq!(snapshot.workers, 4);
    }

    #[test]
    fn test_failures_and_deletes() {
        let stats = StatsInner::default();
        stats.record_write(WriteOutcome::Indexed { vector: false }, 3);
        stats.record_write(WriteOutcome::Deleted, 2);
        stats.record_failure(1);

        let snapshot = stats.snapshot(2);
        assert_eq!(snapshot.documents_indexed, 1);
        assert_eq!(snapshot.vector_inserts, 0);
        assert_eq!(snapshot.documents_deleted, 1);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.queue_depth, 1);
        assert!(snapshot.last_index_time.is_some());
    }
}
