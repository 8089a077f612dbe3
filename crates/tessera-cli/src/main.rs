//! Tessera CLI - command-line harness for the hybrid search engine.
//!
//! # Usage
//!
//! ```bash
//! # Index a JSONL corpus (one document per line)
//! tessera index corpus.jsonl
//!
//! # Full-text, vector and hybrid search
//! tessera search "refund policy" --tenant acme
//! tessera search --vector 0.9,0.1 -n 5
//! tessera search "refund" --vector 0.9,0.1 --json
//!
//! # Maintenance
//! tessera stats
//! tessera optimize
//! ```

mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use commands::SearchArgs;
use config::CliConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tessera_core::QueryType;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Tessera hybrid search CLI.
///
/// Indexes documents into a full-text and a vector index and searches them
/// separately or fused.
#[derive(Parser)]
#[command(name = "tessera", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Custom data directory (default: platform standard location)
    #[arg(long, global = true, env = "TESSERA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config file (default: tessera.toml in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Index a JSONL file of documents
    Index {
        /// Path to the JSONL file
        path: PathBuf,
    },
    /// Search indexed documents
    Search {
        /// Search text
        #[arg(default_value = "")]
        query: String,

        /// Query vector, comma separated
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
        vector: Option<Vec<f64>>,

        /// Retrieval mode (default: inferred from the arguments)
        #[arg(long, value_enum)]
        mode: Option<Mode>,

        /// Restrict results to one tenant
        #[arg(long, default_value = "")]
        tenant: String,

        /// Maximum number of results to return
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,

        /// Number of ranked results to skip
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Show one document
    Get {
        id: String,

        /// Only return the document if it belongs to this tenant
        #[arg(long)]
        tenant: Option<String>,
    },
    /// List a tenant's documents, newest first
    List {
        tenant: String,

        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Delete a document from both indexes
    Delete { id: String },
    /// Show index and engine statistics
    Stats,
    /// Merge full-text index segments
    Optimize,
    /// Drop and recreate the full-text index (discards all text documents)
    Rebuild,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Text,
    Vector,
    Hybrid,
}

impl From<Mode> for QueryType {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Text => QueryType::FullText,
            Mode::Vector => QueryType::Vector,
            Mode::Hybrid => QueryType::Hybrid,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let data_dir = config::get_data_dir(cli.data_dir.as_ref())?;
    let settings = CliConfig::load(cli.config.as_deref(), &data_dir)?;
    let engine = Arc::new(commands::open_engine(&data_dir, &settings)?);

    let result = run(&cli, &engine).await;
    // Close even when the command failed so queued writes are not lost
    if let Err(e) = commands::close_engine(&engine).await {
        warn!("Shutdown incomplete: {:#}", e);
    }
    println!("{}", result?);
    Ok(())
}

async fn run(cli: &Cli, engine: &Arc<commands::CliEngine>) -> Result<String> {
    let output = match &cli.command {
        Command::Index { path } => {
            let report = commands::index_jsonl(Arc::clone(engine), path).await?;
            if cli.json {
                serde_json::json!({ "indexed": report.indexed, "failed": report.failed })
                    .to_string()
            } else {
                format!(
                    "Indexed {} document{} ({} failed)",
                    report.indexed,
                    if report.indexed == 1 { "" } else { "s" },
                    report.failed
                )
            }
        }
        Command::Search {
            query,
            vector,
            mode,
            tenant,
            limit,
            offset,
        } => {
            let args = SearchArgs {
                query: query.clone(),
                vector: vector.clone(),
                query_type: mode.map(QueryType::from),
                tenant: tenant.clone(),
                limit: *limit,
                offset: *offset,
            };
            commands::search(engine, &args, cli.json).await?
        }
        Command::Get { id, tenant } => {
            let doc = engine
                .document(id, tenant.as_deref())
                .await
                .with_context(|| format!("Failed to fetch {}", id))?;
            output::format_document(&doc, cli.json)
        }
        Command::List {
            tenant,
            limit,
            offset,
        } => {
            let docs = engine
                .tenant_documents(tenant, *limit, *offset)
                .await
                .context("Failed to list documents")?;
            output::format_listing(tenant, &docs, cli.json)
        }
        Command::Delete { id } => {
            engine
                .delete(id)
                .await
                .with_context(|| format!("Failed to delete {}", id))?;
            format!("Deleted {}", id)
        }
        Command::Stats => {
            let text = engine.text_stats().await.context("Failed to read text stats")?;
            output::format_stats(&engine.stats(), &text, &engine.vector_stats(), cli.json)
        }
        Command::Optimize => {
            engine.optimize().await.context("Failed to optimize")?;
            "Optimized full-text index".to_string()
        }
        Command::Rebuild => {
            engine
                .rebuild_text()
                .await
                .context("Failed to rebuild full-text index")?;
            "Rebuilt full-text index; vectors are kept but return no documents until re-indexed"
                .to_string()
        }
    };
    Ok(output)
}
