//! Output formatting for search results, documents and statistics.
//!
//! Supports both human-readable terminal output and JSON for scripting.

use serde::Serialize;
use tessera_core::text::TextIndexStats;
use tessera_core::vector::VectorIndexStats;
use tessera_core::{Document, EngineStats, SearchResults};

/// Maximum characters to show in a content snippet
const SNIPPET_MAX_LEN: usize = 200;

/// JSON output structure for search results
#[derive(Serialize)]
pub struct JsonOutput<'a> {
    pub query: &'a str,
    pub total: usize,
    pub query_time_ms: f64,
    pub results: Vec<JsonResult<'a>>,
}

/// One ranked document in JSON format
#[derive(Serialize)]
pub struct JsonResult<'a> {
    pub id: &'a str,
    pub tenant_id: &'a str,
    #[serde(rename = "type")]
    pub doc_type: &'static str,
    pub title: &'a str,
    pub score: f64,
    pub snippet: String,
}

/// Formats search results as JSON.
pub fn format_json(query: &str, results: &SearchResults) -> String {
    let output = JsonOutput {
        query,
        total: results.total,
        query_time_ms: results.query_time.as_secs_f64() * 1000.0,
        results: results
            .documents
            .iter()
            .zip(&results.scores)
            .map(|(doc, score)| JsonResult {
                id: &doc.id,
                tenant_id: &doc.tenant_id,
                doc_type: doc.doc_type.as_str(),
                title: &doc.title,
                score: *score,
                snippet: truncate_text(&doc.content, SNIPPET_MAX_LEN),
            })
            .collect(),
    };
    to_json(&output)
}

/// Formats search results for human-readable terminal output.
pub fn format_human(query: &str, results: &SearchResults) -> String {
    if results.is_empty() {
        return format!("No results found for \"{}\"", query);
    }

    let mut output = String::new();
    output.push_str(&format!(
        "Found {} result{} for \"{}\" ({:.1} ms):\n\n",
        results.len(),
        if results.len() == 1 { "" } else { "s" },
        query,
        results.query_time.as_secs_f64() * 1000.0
    ));

    for (i, (doc, score)) in results.documents.iter().zip(&results.scores).enumerate() {
        let name = if doc.title.is_empty() { &doc.id } else { &doc.title };
        output.push_str(&format!("{}. {} (score: {:.4})\n", i + 1, name, score));
        output.push_str(&format!(
            "   [{} | tenant: {} | id: {}]\n",
            doc.doc_type, doc.tenant_id, doc.id
        ));

        let snippet = truncate_text(&doc.content, SNIPPET_MAX_LEN);
        if !snippet.is_empty() {
            output.push_str(&format!("   {}\n", indent_text(&snippet, "   ")));
        }
        output.push('\n');
    }

    output.trim_end().to_string()
}

/// Formats one document, in full.
pub fn format_document(doc: &Document, json: bool) -> String {
    if json {
        return to_json(doc);
    }

    let mut output = format!("{} [{} | tenant: {}]\n", doc.id, doc.doc_type, doc.tenant_id);
    if !doc.title.is_empty() {
        output.push_str(&format!("Title: {}\n", doc.title));
    }
    if !doc.metadata.is_empty() {
        output.push_str(&format!(
            "Metadata: {}\n",
            serde_json::Value::Object(doc.metadata.clone())
        ));
    }
    if let Some(vector) = &doc.vector {
        output.push_str(&format!("Vector: {} dimensions\n", vector.len()));
    }
    output.push('\n');
    output.push_str(doc.content.trim());
    output
}

/// Formats a tenant listing.
pub fn format_listing(tenant: &str, docs: &[Document], json: bool) -> String {
    if json {
        return to_json(&docs);
    }
    if docs.is_empty() {
        return format!("No documents for tenant \"{}\"", tenant);
    }

    docs.iter()
        .map(|doc| {
            let name = if doc.title.is_empty() { "" } else { doc.title.as_str() };
            format!("{}\t{}\t{}", doc.id, doc.doc_type, name)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Serialize)]
struct StatsOutput<'a> {
    engine: &'a EngineStats,
    text: &'a TextIndexStats,
    vector: &'a VectorIndexStats,
}

/// Formats engine, text and vector statistics together.
pub fn format_stats(
    engine: &EngineStats,
    text: &TextIndexStats,
    vector: &VectorIndexStats,
    json: bool,
) -> String {
    if json {
        return to_json(&StatsOutput {
            engine,
            text,
            vector,
        });
    }

    let mut output = String::new();
    output.push_str("Text index\n");
    output.push_str(&format!("  documents:      {}\n", text.total_documents));
    output.push_str(&format!("  content bytes:  {}\n", text.total_content_length));
    for (doc_type, count) in &text.documents_by_type {
        output.push_str(&format!("    {:<12} {}\n", doc_type, count));
    }

    output.push_str("Vector index\n");
    output.push_str(&format!("  vectors:        {}\n", vector.vector_count));
    output.push_str(&format!("  levels:         {}\n", vector.level_count));
    output.push_str(&format!("  edges:          {}\n", vector.total_edges));
    output.push_str(&format!("  average degree: {:.2}\n", vector.average_degree));

    output.push_str("Engine\n");
    output.push_str(&format!("  workers:        {}\n", engine.workers));
    output.push_str(&format!("  queue depth:    {}\n", engine.queue_depth));
    output.push_str(&format!("  indexed:        {}\n", engine.documents_indexed));
    output.push_str(&format!("  failed:         {}", engine.tasks_failed));
    output
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

/// Cuts a snippet to at most `max_bytes`, backing off to a char boundary and
/// then to the last word break.
fn truncate_text(text: &str, max_bytes: usize) -> String {
    let text = text.trim();
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let cut = (0..=max_bytes)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0);
    let head = &text[..cut];
    let head = head.rsplit_once(' ').map_or(head, |(words, _)| words);
    format!("{head}...")
}

/// Prefixes every line but the first with `prefix`.
fn indent_text(text: &str, prefix: &str) -> String {
    let separator = format!("\n{prefix}");
    text.lines().collect::<Vec<_>>().join(&separator)
}
