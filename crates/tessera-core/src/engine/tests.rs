//! Tests for the hybrid Engine.

use super::*;
use crate::config::{TextIndexConfig, VectorIndexConfig};
use crate::storage::{MemoryKvStore, StoreError, WriteBatch, WriteOptions};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Memory store whose writes can be failed or held back from a test.
#[derive(Default)]
struct ControlledStore {
    inner: MemoryKvStore,
    fail_writes: AtomicBool,
    gate: Mutex<()>,
}

impl KvStore for ControlledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn write(&self, batch: WriteBatch, opts: WriteOptions) -> Result<(), StoreError> {
        let _open = self.gate.lock().unwrap();
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::IoError("disk full".to_string()));
        }
        self.inner.write(batch, opts)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.inner.scan_prefix(prefix)
    }
}

fn vector_config() -> VectorIndexConfig {
    VectorIndexConfig {
        dimension: 2,
        seed: Some(11),
        ..Default::default()
    }
}

fn create_engine_on<S: KvStore + 'static>(store: S, config: EngineConfig) -> Engine<S> {
    let text = InvertedIndex::open_in_memory(&TextIndexConfig::default()).unwrap();
    let vector = HnswIndex::open(store, vector_config()).unwrap();
    Engine::new(config, Arc::new(text), Arc::new(vector)).unwrap()
}

fn create_test_engine() -> Engine<MemoryKvStore> {
    create_engine_on(MemoryKvStore::new(), EngineConfig::default())
}

fn doc(id: &str, tenant: &str, content: &str, vector: Option<Vec<f64>>) -> Document {
    let doc = Document::new(id, tenant, DocumentType::Record, content);
    match vector {
        Some(v) => doc.with_vector(v),
        None => doc,
    }
}

/// Indexes the two-document corpus used by most tests.
async fn seed(engine: &Engine<impl KvStore + 'static>) {
    engine
        .index(doc("a", "t1", "refund policy", Some(vec![1.0, 0.0])))
        .await
        .unwrap();
    engine
        .index(doc("b", "t1", "shipping policy", Some(vec![0.0, 1.0])))
        .await
        .unwrap();
}

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn test_concrete_scenario() {
    let engine = create_test_engine();
    seed(&engine).await;

    let results = engine
        .search(&cancel(), &Query::text("refund").for_tenant("t1"))
        .await
        .unwrap();
    assert_eq!(results.ids(), vec!["a"]);

    let results = engine
        .search(&cancel(), &Query::vector(vec![0.9, 0.1]))
        .await
        .unwrap();
    assert_eq!(results.ids(), vec!["a", "b"]);
    assert!(results.scores[0] > results.scores[1]);

    let results = engine
        .search(&cancel(), &Query::text("refund").for_tenant("t2"))
        .await
        .unwrap();
    assert!(results.is_empty());

    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_hybrid_search_fuses_both_sides() {
    let engine = create_test_engine();
    seed(&engine).await;

    // Both match "policy" equally; the vector side decides
    let results = engine
        .search(
            &cancel(),
            &Query::hybrid("policy", vec![0.0, 1.0]).for_tenant("t1"),
        )
        .await
        .unwrap();
    assert_eq!(results.ids(), vec!["b", "a"]);
    assert!(results.scores[0] > results.scores[1]);
    assert_eq!(results.total, 2);
}

#[tokio::test]
async fn test_hybrid_search_tolerates_one_failing_side() {
    let engine = create_test_engine();
    seed(&engine).await;

    // No query vector: text alone answers
    let query = Query {
        text: "refund".to_string(),
        query_type: QueryType::Hybrid,
        ..Default::default()
    };
    let results = engine.search(&cancel(), &query).await.unwrap();
    assert_eq!(results.ids(), vec!["a"]);

    // Blank text: vector alone answers
    let results = engine
        .search(&cancel(), &Query::hybrid("", vec![1.0, 0.0]))
        .await
        .unwrap();
    assert_eq!(results.ids(), vec!["a", "b"]);

    // Neither side usable
    let query = Query {
        query_type: QueryType::Hybrid,
        ..Default::default()
    };
    assert!(matches!(
        engine.search(&cancel(), &query).await,
        Err(EngineError::HybridFailed { .. })
    ));
}

#[tokio::test]
async fn test_hybrid_search_on_empty_vector_index() {
    let engine = create_test_engine();
    engine
        .index(doc("a", "t1", "refund policy", None))
        .await
        .unwrap();

    let results = engine
        .search(&cancel(), &Query::hybrid("refund", vec![1.0, 0.0]))
        .await
        .unwrap();
    assert_eq!(results.ids(), vec!["a"]);

    assert!(matches!(
        engine.search(&cancel(), &Query::vector(vec![1.0, 0.0])).await,
        Err(EngineError::Vector(VectorIndexError::EmptyIndex))
    ));
}

#[tokio::test]
async fn test_vector_hydration_is_tenant_scoped() {
    let engine = create_test_engine();
    seed(&engine).await;
    engine
        .index(doc("c", "t2", "refund policy", Some(vec![1.0, 0.0])))
        .await
        .unwrap();

    let results = engine
        .search(&cancel(), &Query::vector(vec![1.0, 0.0]).for_tenant("t1"))
        .await
        .unwrap();
    assert!(results.ids().iter().all(|id| *id != "c"));
    assert_eq!(results.ids()[0], "a");

    let results = engine
        .search(&cancel(), &Query::vector(vec![1.0, 0.0]).for_tenant("t2"))
        .await
        .unwrap();
    assert_eq!(results.ids(), vec!["c"]);
}

#[tokio::test]
async fn test_tenant_isolation_for_identical_content() {
    let engine = create_test_engine();
    engine
        .index(doc("x1", "acme", "quarterly report", None))
        .await
        .unwrap();
    engine
        .index(doc("x2", "globex", "quarterly report", None))
        .await
        .unwrap();

    let results = engine
        .search(&cancel(), &Query::text("quarterly").for_tenant("acme"))
        .await
        .unwrap();
    assert_eq!(results.ids(), vec!["x1"]);

    let results = engine
        .search(&cancel(), &Query::text("quarterly"))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn test_injection_attempt_is_inert() {
    let engine = create_test_engine();
    seed(&engine).await;

    let results = engine
        .search(
            &cancel(),
            &Query::text("\"; DROP TABLE x; --").for_tenant("t1"),
        )
        .await
        .unwrap();
    assert!(results.is_empty());

    let results = engine
        .search(&cancel(), &Query::text("refund").for_tenant("t1"))
        .await
        .unwrap();
    assert_eq!(results.ids(), vec!["a"]);
}

#[tokio::test]
async fn test_structured_query_not_implemented() {
    let engine = create_test_engine();
    let query = Query {
        text: "SELECT 1".to_string(),
        query_type: QueryType::Structured,
        ..Default::default()
    };
    assert!(matches!(
        engine.search(&cancel(), &query).await,
        Err(EngineError::NotImplemented(_))
    ));
}

#[tokio::test]
async fn test_query_validation() {
    let engine = create_test_engine();
    seed(&engine).await;

    let result = engine
        .search(&cancel(), &Query::text("policy").with_limit(MAX_SEARCH_LIMIT + 1))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidQuery(_))));

    let result = engine
        .search(&cancel(), &Query::text("policy").for_tenant("t1\" OR 1"))
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Text(TextIndexError::InvalidTenant(_)))
    ));

    let result = engine.search(&cancel(), &Query::text("   ")).await;
    assert!(matches!(
        result,
        Err(EngineError::Text(TextIndexError::EmptyQuery))
    ));

    let query = Query {
        query_type: QueryType::Vector,
        ..Default::default()
    };
    assert!(matches!(
        engine.search(&cancel(), &query).await,
        Err(EngineError::InvalidQuery(_))
    ));

    let result = engine
        .search(&cancel(), &Query::vector(vec![1.0, 0.0, 0.0]))
        .await;
    assert!(matches!(
        result,
        Err(EngineError::Vector(VectorIndexError::DimensionMismatch {
            expected: 2,
            actual: 3
        }))
    ));
}

#[tokio::test]
async fn test_limit_and_offset() {
    let engine = create_test_engine();
    for i in 0..6 {
        engine
            .index(doc(&format!("d{}", i), "t1", "policy", None))
            .await
            .unwrap();
    }

    let all = engine
        .search(&cancel(), &Query::text("policy").with_limit(6))
        .await
        .unwrap();
    assert_eq!(all.len(), 6);

    let page = engine
        .search(
            &cancel(),
            &Query::text("policy").with_limit(2).with_offset(2),
        )
        .await
        .unwrap();
    assert_eq!(page.ids(), all.ids()[2..4].to_vec());
    assert_eq!(page.scores.len(), 2);

    let default_limit = EngineConfig {
        default_limit: 3,
        ..EngineConfig::default()
    };
    let small = create_engine_on(MemoryKvStore::new(), default_limit);
    for i in 0..5 {
        small
            .index(doc(&format!("d{}", i), "t1", "policy", None))
            .await
            .unwrap();
    }
    let results = small
        .search(&cancel(), &Query::text("policy"))
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn test_reindex_is_idempotent() {
    let engine = create_test_engine();
    engine
        .index(doc("a", "t1", "refund policy", Some(vec![1.0, 0.0])))
        .await
        .unwrap();
    engine
        .index(doc("a", "t1", "warranty terms", Some(vec![0.0, 1.0])))
        .await
        .unwrap();

    assert_eq!(engine.text_stats().await.unwrap().total_documents, 1);
    assert_eq!(engine.vector_stats().vector_count, 1);

    let results = engine
        .search(&cancel(), &Query::text("refund"))
        .await
        .unwrap();
    assert!(results.is_empty());

    let fetched = engine.document("a", Some("t1")).await.unwrap();
    assert_eq!(fetched.content, "warranty terms");
    assert_eq!(fetched.vector, Some(vec![0.0, 1.0]));
    assert!(fetched.timestamp > 0);
}

#[tokio::test]
async fn test_reindex_without_vector_drops_old_vector() {
    let engine = create_test_engine();
    seed(&engine).await;
    engine
        .index(doc("a", "t1", "refund policy", None))
        .await
        .unwrap();

    assert_eq!(engine.vector_stats().vector_count, 1);
    let results = engine
        .search(&cancel(), &Query::vector(vec![1.0, 0.0]))
        .await
        .unwrap();
    assert_eq!(results.ids(), vec!["b"]);
}

#[tokio::test]
async fn test_update_replaces_document() {
    let engine = create_test_engine();
    seed(&engine).await;

    engine
        .update(doc("a", "t1", "exchange window", Some(vec![0.5, 0.5])))
        .await
        .unwrap();

    let refund = engine
        .search(&cancel(), &Query::text("refund"))
        .await
        .unwrap();
    assert!(refund.is_empty());

    let exchange = engine
        .search(&cancel(), &Query::text("exchange"))
        .await
        .unwrap();
    assert_eq!(exchange.ids(), vec!["a"]);

    // A rejected update leaves the old document alone
    let bad = doc("a", "t1", "ignored", Some(vec![1.0]));
    assert!(engine.update(bad).await.is_err());
    assert_eq!(
        engine.document("a", None).await.unwrap().content,
        "exchange window"
    );
}

#[tokio::test]
async fn test_delete_then_miss() {
    let engine = create_test_engine();
    seed(&engine).await;

    engine.delete("a").await.unwrap();
    // Deleting again is not an error
    engine.delete("a").await.unwrap();

    for query in [
        Query::text("refund"),
        Query::vector(vec![1.0, 0.0]),
        Query::hybrid("policy", vec![1.0, 0.0]),
    ] {
        let results = engine.search(&cancel(), &query).await.unwrap();
        assert!(results.ids().iter().all(|id| *id != "a"), "{:?}", query);
    }

    assert!(matches!(
        engine.document("a", None).await,
        Err(EngineError::Text(TextIndexError::NotFound(_)))
    ));
    assert!(matches!(
        engine.vector_index().get("a"),
        Err(VectorIndexError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_documents_are_rejected_before_writing() {
    let engine = create_test_engine();

    let err = engine
        .index(doc("a", "t1", "refund", Some(vec![1.0, 0.0, 0.0])))
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(matches!(
        err,
        EngineError::Vector(VectorIndexError::DimensionMismatch { .. })
    ));

    let err = engine
        .index(doc("b", "bad tenant", "refund", None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidQuery(_)));

    // Separator-only tenants could never be found by a scoped search
    let err = engine
        .index(doc("c", "___", "refund", None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidQuery(_)));

    let err = engine.index(doc("", "t1", "refund", None)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidQuery(_)));

    assert_eq!(engine.text_stats().await.unwrap().total_documents, 0);
    assert_eq!(engine.stats().tasks_failed, 4);
}

#[tokio::test]
async fn test_partial_write_is_compensated() {
    let store = Arc::new(ControlledStore::default());
    let engine = create_engine_on(Arc::clone(&store), EngineConfig::default());

    store.fail_writes.store(true, Ordering::SeqCst);
    let err = engine
        .index(doc("a", "t1", "refund policy", Some(vec![1.0, 0.0])))
        .await
        .unwrap_err();
    match err {
        EngineError::PartialWrite {
            id,
            compensated,
            source,
        } => {
            assert_eq!(id, "a");
            assert!(compensated);
            assert!(matches!(source, VectorIndexError::Storage(_)));
        }
        other => panic!("expected PartialWrite, got {:?}", other),
    }

    // The text side was rolled back
    let results = engine
        .search(&cancel(), &Query::text("refund"))
        .await
        .unwrap();
    assert!(results.is_empty());

    store.fail_writes.store(false, Ordering::SeqCst);
    engine
        .index(doc("a", "t1", "refund policy", Some(vec![1.0, 0.0])))
        .await
        .unwrap();
    let results = engine
        .search(&cancel(), &Query::text("refund"))
        .await
        .unwrap();
    assert_eq!(results.ids(), vec!["a"]);
}

/// Polls `condition` until it holds or a second passes.
async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_backpressure() {
    let store = Arc::new(ControlledStore::default());
    let config = EngineConfig {
        workers: 1,
        queue_size: 1,
        enqueue_timeout_ms: 50,
        ..EngineConfig::default()
    };
    let engine = Arc::new(create_engine_on(Arc::clone(&store), config));

    // Hold the only worker inside a vector write
    let gate = store.gate.lock().unwrap();
    let busy = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .index(doc("a", "t1", "refund", Some(vec![1.0, 0.0])))
                .await
        })
    };
    wait_until(|| engine.stats().queue_depth == 0 && engine.text_index().document("a", None).is_ok())
        .await;

    // Fill the single queue slot
    let queued = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.update(doc("b", "t1", "shipping", None)).await })
    };
    wait_until(|| engine.stats().queue_depth == 1).await;

    // Update and delete fail at once; index waits, then times out
    assert!(matches!(
        engine.update(doc("c", "t1", "x", None)).await,
        Err(EngineError::QueueFull)
    ));
    assert!(matches!(
        engine.delete("a").await,
        Err(EngineError::QueueFull)
    ));
    assert!(matches!(
        engine.index(doc("d", "t1", "x", None)).await,
        Err(EngineError::EnqueueTimeout(_))
    ));

    drop(gate);
    busy.await.unwrap().unwrap();
    queued.await.unwrap().unwrap();
    assert_eq!(engine.stats().documents_indexed, 2);
}

#[tokio::test]
async fn test_abandoned_wait_still_runs_task() {
    let store = Arc::new(ControlledStore::default());
    let config = EngineConfig {
        workers: 1,
        ..EngineConfig::default()
    };
    let engine = Arc::new(create_engine_on(Arc::clone(&store), config));

    let gate = store.gate.lock().unwrap();
    let waiter = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .index(doc("a", "t1", "refund", Some(vec![1.0, 0.0])))
                .await
        })
    };
    wait_until(|| engine.stats().queue_depth == 0 && engine.text_index().document("a", None).is_ok())
        .await;
    waiter.abort();
    drop(gate);

    wait_until(|| engine.vector_index().contains("a").unwrap_or(false)).await;
    wait_until(|| engine.stats().documents_indexed == 1).await;
}

#[tokio::test]
async fn test_cancelled_search() {
    let engine = create_test_engine();
    seed(&engine).await;

    let token = CancellationToken::new();
    token.cancel();
    for query in [
        Query::text("refund"),
        Query::vector(vec![1.0, 0.0]),
        Query::hybrid("refund", vec![1.0, 0.0]),
    ] {
        assert!(matches!(
            engine.search(&token, &query).await,
            Err(EngineError::Cancelled)
        ));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close() {
    let engine = Arc::new(create_test_engine());

    let writers: Vec<_> = (0..20)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .index(doc(&format!("d{}", i), "t1", "policy", None))
                    .await
            })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(10), engine.close())
        .await
        .unwrap()
        .unwrap();
    // Second close is a no-op
    engine.close().await.unwrap();

    let mut indexed = 0;
    for writer in writers {
        match writer.await.unwrap() {
            Ok(()) => indexed += 1,
            Err(EngineError::ShutDown) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!(
        engine.text_stats().await.unwrap().total_documents,
        indexed as u64
    );

    assert!(matches!(
        engine.index(doc("late", "t1", "policy", None)).await,
        Err(EngineError::ShutDown)
    ));
    assert!(matches!(
        engine.delete("d0").await,
        Err(EngineError::ShutDown)
    ));
    assert!(matches!(
        engine.search(&cancel(), &Query::text("policy")).await,
        Err(EngineError::ShutDown)
    ));
}

#[tokio::test]
async fn test_stats() {
    let engine = create_test_engine();
    let initial = engine.stats();
    assert_eq!(initial.documents_indexed, 0);
    assert_eq!(initial.workers, 4);
    assert!(initial.last_index_time.is_none());

    seed(&engine).await;
    engine
        .index(doc("c", "t1", "no vector here", None))
        .await
        .unwrap();
    engine.delete("c").await.unwrap();
    engine
        .search(&cancel(), &Query::text("policy"))
        .await
        .unwrap();
    engine
        .search(&cancel(), &Query::vector(vec![1.0, 0.0]))
        .await
        .unwrap();

    let stats = engine.stats();
    assert_eq!(stats.documents_indexed, 3);
    assert_eq!(stats.vector_inserts, 2);
    assert_eq!(stats.documents_deleted, 1);
    assert_eq!(stats.searches_performed, 2);
    assert_eq!(stats.queue_depth, 0);
    assert!(stats.last_index_time.is_some());
    assert!(stats.last_query_time.is_some());

    let vector = engine.vector_stats();
    assert_eq!(vector.vector_count, 2);
    assert_eq!(vector.searches_performed, 1);
}

#[tokio::test]
async fn test_tenant_documents_and_optimize() {
    let engine = create_test_engine();
    seed(&engine).await;
    engine
        .index(doc("c", "t2", "other tenant", None))
        .await
        .unwrap();

    let docs = engine.tenant_documents("t1", 0, 0).await.unwrap();
    let mut ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(docs.iter().all(|d| d.doc_type == DocumentType::Record));

    engine.optimize().await.unwrap();
    let results = engine
        .search(&cancel(), &Query::text("policy").for_tenant("t1"))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn test_rebuild_text_discards_text_keeps_vectors() {
    let engine = create_test_engine();
    seed(&engine).await;
    let vectors = engine.vector_stats().vector_count;

    engine.rebuild_text().await.unwrap();

    assert_eq!(engine.text_stats().await.unwrap().total_documents, 0);
    assert_eq!(engine.vector_stats().vector_count, vectors);
    let results = engine
        .search(&cancel(), &Query::text("policy").for_tenant("t1"))
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_rejects_invalid_config() {
    let text = Arc::new(InvertedIndex::open_in_memory(&TextIndexConfig::default()).unwrap());
    let vector = Arc::new(HnswIndex::open(MemoryKvStore::new(), vector_config()).unwrap());
    let config = EngineConfig {
        workers: 0,
        ..EngineConfig::default()
    };
    assert!(matches!(
        Engine::new(config, text, vector),
        Err(EngineError::InvalidConfig(_))
    ));
}
