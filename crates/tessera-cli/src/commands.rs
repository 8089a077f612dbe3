//! Command implementations.
//!
//! Every command opens the engine over the data directory, does its work and
//! closes the engine again so queued writes are drained before exit.

use crate::config::{self, CliConfig};
use crate::output;
use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use tessera_core::storage::RedbKvStore;
use tessera_core::{
    CancellationToken, Document, Engine, HnswIndex, InvertedIndex, Query, QueryType,
};
use tokio::task::JoinSet;
use tracing::{info, warn};

pub type CliEngine = Engine<RedbKvStore>;

/// Opens both indexes under `data_dir` and starts an engine over them.
pub fn open_engine(data_dir: &Path, config: &CliConfig) -> Result<CliEngine> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    let text_path = config::text_db_path(data_dir);
    info!("Opening text index: {}", text_path.display());
    let text = InvertedIndex::open(&text_path, &config.text)
        .with_context(|| format!("Failed to open text index: {}", text_path.display()))?;

    let vector_path = config::vector_db_path(data_dir);
    info!("Opening vector index: {}", vector_path.display());
    let store = RedbKvStore::open(&vector_path)
        .with_context(|| format!("Failed to open vector store: {}", vector_path.display()))?;
    let vector = HnswIndex::open(store, config.vector.clone())
        .context("Failed to open vector index")?;

    Engine::new(config.engine.clone(), Arc::new(text), Arc::new(vector))
        .context("Failed to start engine")
}

/// Drains the queue and releases the text database.
pub async fn close_engine(engine: &CliEngine) -> Result<()> {
    engine.close().await.context("Failed to stop engine")?;
    engine
        .text_index()
        .close()
        .context("Failed to close text index")
}

/// Summary of an `index` run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: usize,
    pub failed: usize,
}

/// Indexes every line of a JSONL file as one [`Document`].
///
/// Lines are submitted concurrently, up to twice the worker count in flight.
/// Bad lines are logged and counted; they do not stop the run.
pub async fn index_jsonl(engine: Arc<CliEngine>, path: &Path) -> Result<IndexReport> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let max_in_flight = engine.config().workers * 2;

    let mut report = IndexReport::default();
    let mut in_flight: JoinSet<(usize, Result<(), String>)> = JoinSet::new();

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line_no = line_no + 1;
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        let doc: Document = match serde_json::from_str(&line) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Line {}: invalid document: {}", line_no, e);
                report.failed += 1;
                continue;
            }
        };

        while in_flight.len() >= max_in_flight {
            collect(&mut in_flight, &mut report).await?;
        }
        let engine = Arc::clone(&engine);
        in_flight.spawn(async move { (line_no, engine.index(doc).await.map_err(|e| e.to_string())) });
    }

    while !in_flight.is_empty() {
        collect(&mut in_flight, &mut report).await?;
    }
    Ok(report)
}

async fn collect(
    in_flight: &mut JoinSet<(usize, Result<(), String>)>,
    report: &mut IndexReport,
) -> Result<()> {
    match in_flight.join_next().await {
        Some(Ok((_, Ok(())))) => report.indexed += 1,
        Some(Ok((line_no, Err(e)))) => {
            warn!("Line {}: {}", line_no, e);
            report.failed += 1;
        }
        Some(Err(e)) => return Err(anyhow!("Index task failed: {}", e)),
        None => {}
    }
    Ok(())
}

/// Search options gathered from the command line.
#[derive(Debug, Clone, Default)]
pub struct SearchArgs {
    pub query: String,
    pub vector: Option<Vec<f64>>,
    pub query_type: Option<QueryType>,
    pub tenant: String,
    pub limit: usize,
    pub offset: usize,
}

impl SearchArgs {
    /// Builds the engine query. Without an explicit type, a vector makes the
    /// search hybrid (or pure vector when there is no text).
    pub fn to_query(&self) -> Query {
        let query_type = self.query_type.unwrap_or(match (&self.vector, self.query.trim()) {
            (Some(_), "") => QueryType::Vector,
            (Some(_), _) => QueryType::Hybrid,
            (None, _) => QueryType::FullText,
        });

        Query {
            text: self.query.clone(),
            vector: self.vector.clone(),
            query_type,
            tenant_id: self.tenant.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Runs one search; Ctrl-C cancels it.
pub async fn search(engine: &CliEngine, args: &SearchArgs, json: bool) -> Result<String> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let result = engine.search(&cancel, &args.to_query()).await;
    watcher.abort();
    let results = result.context("Search failed")?;

    Ok(if json {
        output::format_json(&args.query, &results)
    } else {
        output::format_human(&args.query, &results)
    })
}
