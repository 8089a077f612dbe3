//! Tenant-scoped full-text index over SQLite FTS5.
//!
//! Two tables per index, named from the configured prefix:
//!
//! - `{prefix}_fts`: FTS5 virtual table `(docid, tenant_id, doc_type, title, content, metadata)`
//!   ranked with `bm25()`. `docid` and `metadata` are stored but not tokenized.
//! - `{prefix}_meta`: one row per document `(docid PK, tenant_id, doc_type, title,
//!   content_length, created_at, updated_at)` used for listings and aggregates.
//!
//! Both tables are always written in one transaction, so every FTS row has
//! exactly one metadata row.
//!
//! Queries are built by [`query`]; malformed or hostile input degrades to an
//! empty result instead of an SQL error.

pub mod query;

use crate::config::{TextIndexConfig, MAX_SEARCH_LIMIT};
use crate::error::TextIndexError;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use query::is_valid_tenant_id;

/// A document as stored in the text index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDocument {
    pub id: String,
    pub tenant_id: String,
    pub doc_type: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Milliseconds since the Unix epoch of the last write. Set by the index;
    /// ignored on input.
    #[serde(default)]
    pub updated_at: i64,
}

/// Ranked hits as parallel arrays, best first.
///
/// Scores are negated `bm25()` values, so higher is better.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextHits {
    pub documents: Vec<TextDocument>,
    pub scores: Vec<f64>,
}

impl TextHits {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Aggregates over the metadata table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TextIndexStats {
    pub total_documents: u64,
    pub total_content_length: u64,
    pub documents_by_type: BTreeMap<String, u64>,
}

/// Full-text index over one SQLite connection.
///
/// The connection sits behind a mutex; SQLite serializes writers and the
/// mutex makes the index shareable across worker threads.
pub struct InvertedIndex {
    conn: Mutex<Option<Connection>>,
    fts_table: String,
    meta_table: String,
    tokenizer: String,
}

impl InvertedIndex {
    /// Opens (or creates) an index in the SQLite database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: &TextIndexConfig) -> Result<Self, TextIndexError> {
        config.validate()?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TextIndexError::Database(format!("Failed to create database directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| TextIndexError::Database(format!("Failed to open database: {}", e)))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| TextIndexError::Database(format!("Failed to configure pragmas: {}", e)))?;

        info!("Opened text index at {}", path.display());
        Self::with_connection(conn, config)
    }

    /// Creates an index in a private in-memory database.
    pub fn open_in_memory(config: &TextIndexConfig) -> Result<Self, TextIndexError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            TextIndexError::Database(format!("Failed to open in-memory database: {}", e))
        })?;
        Self::with_connection(conn, config)
    }

    /// Wraps an existing connection, creating the tables if needed.
    pub fn with_connection(conn: Connection, config: &TextIndexConfig) -> Result<Self, TextIndexError> {
        config.validate()?;
        let index = Self {
            conn: Mutex::new(None),
            fts_table: format!("{}_fts", config.table_prefix),
            meta_table: format!("{}_meta", config.table_prefix),
            tokenizer: config.tokenizer.clone(),
        };
        index.create_tables(&conn)?;
        *index.lock() = Some(conn);
        Ok(index)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, TextIndexError>,
    ) -> Result<T, TextIndexError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(TextIndexError::Closed)?;
        f(conn)
    }

    fn create_tables(&self, conn: &Connection) -> Result<(), TextIndexError> {
        // Identifiers and tokenizer are validated by TextIndexConfig::validate.
        let fts = &self.fts_table;
        let meta = &self.meta_table;
        let ddl = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {fts} USING fts5(
                docid UNINDEXED,
                tenant_id,
                doc_type,
                title,
                content,
                metadata UNINDEXED,
                tokenize = '{tokenizer}'
            );
            CREATE TABLE IF NOT EXISTS {meta} (
                docid TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                title TEXT,
                content_length INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{meta}_tenant ON {meta}(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_{meta}_type ON {meta}(doc_type);
            CREATE INDEX IF NOT EXISTS idx_{meta}_created ON {meta}(created_at);",
            tokenizer = self.tokenizer,
        );
        conn.execute_batch(&ddl)
            .map_err(|e| TextIndexError::Database(format!("Failed to create tables: {}", e)))
    }

    /// Inserts or replaces the FTS row and metadata row for `doc.id`.
    ///
    /// `created_at` survives replacement; `updated_at` and `content_length`
    /// are recomputed.
    #[instrument(skip_all, fields(id = %doc.id, tenant = %doc.tenant_id))]
    pub fn index(&self, doc: &TextDocument) -> Result<(), TextIndexError> {
        if doc.id.is_empty() {
            return Err(TextIndexError::InvalidDocument(
                "document id must not be empty".to_string(),
            ));
        }
        if !is_valid_tenant_id(&doc.tenant_id) {
            return Err(TextIndexError::InvalidTenant(doc.tenant_id.clone()));
        }
        let metadata = serde_json::to_string(&doc.metadata).map_err(|e| {
            TextIndexError::Serialization(format!("Failed to encode metadata: {}", e))
        })?;
        let now = now_millis();
        let content_length = doc.content.chars().count() as i64;

        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(|e| {
                TextIndexError::Database(format!("Failed to begin transaction: {}", e))
            })?;

            // FTS5 has no primary key, so replace means delete-then-insert.
            tx.execute(
                &format!("DELETE FROM {} WHERE docid = ?1", self.fts_table),
                params![doc.id],
            )
            .map_err(|e| TextIndexError::Database(format!("Failed to replace fts row: {}", e)))?;
            tx.execute(
                &format!(
                    "INSERT INTO {} (docid, tenant_id, doc_type, title, content, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    self.fts_table
                ),
                params![
                    doc.id,
                    doc.tenant_id,
                    doc.doc_type,
                    doc.title,
                    doc.content,
                    metadata
                ],
            )
            .map_err(|e| TextIndexError::Database(format!("Failed to insert fts row: {}", e)))?;
            tx.execute(
                &format!(
                    "INSERT INTO {} (docid, tenant_id, doc_type, title, content_length, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT(docid) DO UPDATE SET
                        tenant_id = excluded.tenant_id,
                        doc_type = excluded.doc_type,
                        title = excluded.title,
                        content_length = excluded.content_length,
                        updated_at = excluded.updated_at",
                    self.meta_table
                ),
                params![doc.id, doc.tenant_id, doc.doc_type, doc.title, content_length, now],
            )
            .map_err(|e| {
                TextIndexError::Database(format!("Failed to upsert metadata row: {}", e))
            })?;

            tx.commit()
                .map_err(|e| TextIndexError::Database(format!("Failed to commit index: {}", e)))
        })?;

        debug!("Indexed text document ({} chars)", content_length);
        Ok(())
    }

    /// Removes both rows for `id`. Returns whether anything was deleted.
    pub fn delete(&self, id: &str) -> Result<bool, TextIndexError> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(|e| {
                TextIndexError::Database(format!("Failed to begin transaction: {}", e))
            })?;
            let fts_rows = tx
                .execute(
                    &format!("DELETE FROM {} WHERE docid = ?1", self.fts_table),
                    params![id],
                )
                .map_err(|e| TextIndexError::Database(format!("Failed to delete fts row: {}", e)))?;
            let meta_rows = tx
                .execute(
                    &format!("DELETE FROM {} WHERE docid = ?1", self.meta_table),
                    params![id],
                )
                .map_err(|e| {
                    TextIndexError::Database(format!("Failed to delete metadata row: {}", e))
                })?;
            tx.commit()
                .map_err(|e| TextIndexError::Database(format!("Failed to commit delete: {}", e)))?;
            Ok(fts_rows + meta_rows > 0)
        })
    }

    /// Ranked search, optionally scoped to a tenant.
    ///
    /// An empty `tenant_id` searches all tenants. Input that sanitizes to
    /// nothing returns an empty result rather than an error.
    #[instrument(skip_all, fields(tenant = %tenant_id, limit))]
    pub fn search(
        &self,
        cancel: &CancellationToken,
        query: &str,
        tenant_id: &str,
        limit: usize,
    ) -> Result<TextHits, TextIndexError> {
        if query.trim().is_empty() {
            return Err(TextIndexError::EmptyQuery);
        }
        validate_limit(limit)?;
        if !tenant_id.is_empty() && !is_valid_tenant_id(tenant_id) {
            return Err(TextIndexError::InvalidTenant(tenant_id.to_string()));
        }

        let Some(mut expression) = query::build_match_expression(query) else {
            debug!("Query sanitized to nothing, returning empty result");
            return Ok(TextHits::default());
        };
        if !tenant_id.is_empty() {
            expression = query::scope_to_tenant(&expression, tenant_id);
        }

        if cancel.is_cancelled() {
            return Err(TextIndexError::Cancelled);
        }

        let fts = &self.fts_table;
        let meta = &self.meta_table;
        // The tenant phrase narrows the match; the equality check keeps ids that
        // tokenize alike (e.g. "a-b" and "a_b") apart.
        let sql = format!(
            "SELECT docid, tenant_id, doc_type, title, content, metadata,
                    (SELECT updated_at FROM {meta} WHERE {meta}.docid = {fts}.docid),
                    bm25({fts}) AS score
             FROM {fts}
             WHERE {fts} MATCH ?1 AND (?2 = '' OR tenant_id = ?2)
             ORDER BY score ASC, docid ASC
             LIMIT ?3"
        );

        let hits = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(&sql)
                .map_err(|e| TextIndexError::Database(format!("Failed to prepare search: {}", e)))?;
            let rows = stmt
                .query_map(params![expression, tenant_id, limit as i64], |row| {
                    Ok((document_from_row(row)?, row.get::<_, f64>(7)?))
                })
                .map_err(|e| TextIndexError::Database(format!("Failed to run search: {}", e)))?;

            let mut hits = TextHits::default();
            for row in rows {
                let (doc, bm25) = row.map_err(|e| {
                    TextIndexError::Database(format!("Failed to read search row: {}", e))
                })?;
                hits.documents.push(doc);
                hits.scores.push(-bm25);
            }
            Ok(hits)
        })?;

        debug!("Text search returned {} hits", hits.len());
        Ok(hits)
    }

    /// Looks up one document, optionally requiring it to belong to `tenant_id`.
    pub fn document(&self, id: &str, tenant_id: Option<&str>) -> Result<TextDocument, TextIndexError> {
        let tenant = tenant_id.unwrap_or("");
        let sql = format!(
            "SELECT docid, tenant_id, doc_type, title, content, metadata,
                    (SELECT updated_at FROM {meta} WHERE {meta}.docid = {fts}.docid)
             FROM {fts} WHERE docid = ?1 AND (?2 = '' OR tenant_id = ?2)",
            fts = self.fts_table,
            meta = self.meta_table,
        );
        let found = self.with_conn(|conn| {
            conn.query_row(&sql, params![id, tenant], document_from_row)
                .optional()
                .map_err(|e| TextIndexError::Database(format!("Failed to get document: {}", e)))
        })?;

        found.ok_or_else(|| TextIndexError::NotFound(id.to_string()))
    }

    /// Lists a tenant's documents, most recently updated first.
    pub fn documents_by_tenant(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TextDocument>, TextIndexError> {
        if !is_valid_tenant_id(tenant_id) {
            return Err(TextIndexError::InvalidTenant(tenant_id.to_string()));
        }
        validate_limit(limit)?;

        let sql = format!(
            "SELECT f.docid, f.tenant_id, f.doc_type, f.title, f.content, f.metadata, m.updated_at
             FROM {fts} f
             JOIN {meta} m ON f.docid = m.docid
             WHERE m.tenant_id = ?1
             ORDER BY m.updated_at DESC, m.docid ASC
             LIMIT ?2 OFFSET ?3",
            fts = self.fts_table,
            meta = self.meta_table,
        );
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(&sql)
                .map_err(|e| TextIndexError::Database(format!("Failed to prepare listing: {}", e)))?;
            let rows = stmt
                .query_map(
                    params![tenant_id, limit as i64, offset as i64],
                    document_from_row,
                )
                .map_err(|e| {
                    TextIndexError::Database(format!("Failed to query tenant documents: {}", e))
                })?;

            let mut docs = Vec::new();
            for row in rows {
                let doc = row.map_err(|e| {
                    TextIndexError::Database(format!("Failed to read tenant document: {}", e))
                })?;
                docs.push(doc);
            }
            Ok(docs)
        })
    }

    /// Document count, total content length and per-type counts.
    pub fn stats(&self) -> Result<TextIndexStats, TextIndexError> {
        let meta = &self.meta_table;
        self.with_conn(|conn| {
            let (total, length): (i64, i64) = conn
                .query_row(
                    &format!("SELECT COUNT(*), COALESCE(SUM(content_length), 0) FROM {meta}"),
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(|e| TextIndexError::Database(format!("Failed to count documents: {}", e)))?;

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT doc_type, COUNT(*) FROM {meta} GROUP BY doc_type"
                ))
                .map_err(|e| TextIndexError::Database(format!("Failed to query by type: {}", e)))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| TextIndexError::Database(format!("Failed to query by type: {}", e)))?;

            let mut documents_by_type = BTreeMap::new();
            for row in rows {
                let (doc_type, count) = row
                    .map_err(|e| TextIndexError::Database(format!("Failed to read type row: {}", e)))?;
                documents_by_type.insert(doc_type, count.max(0) as u64);
            }

            Ok(TextIndexStats {
                total_documents: total.max(0) as u64,
                total_content_length: length.max(0) as u64,
                documents_by_type,
            })
        })
    }

    /// Merges FTS5 b-tree segments.
    pub fn optimize(&self) -> Result<(), TextIndexError> {
        let fts = &self.fts_table;
        self.with_conn(|conn| {
            conn.execute(&format!("INSERT INTO {fts}({fts}) VALUES('optimize')"), [])
                .map_err(|e| TextIndexError::Database(format!("Failed to optimize fts: {}", e)))?;
            Ok(())
        })?;
        info!("Optimized text index {}", fts);
        Ok(())
    }

    /// Drops and recreates both tables, discarding every document.
    ///
    /// Must not run concurrently with writers.
    pub fn rebuild(&self) -> Result<(), TextIndexError> {
        self.with_conn(|conn| {
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {}; DROP TABLE IF EXISTS {};",
                self.fts_table, self.meta_table
            ))
            .map_err(|e| TextIndexError::Database(format!("Failed to drop tables: {}", e)))?;
            self.create_tables(conn)
        })?;
        warn!("Rebuilt text index {}; all documents dropped", self.fts_table);
        Ok(())
    }

    /// Closes the connection. Later calls fail with [`TextIndexError::Closed`].
    pub fn close(&self) -> Result<(), TextIndexError> {
        let conn = self.lock().take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, e)| {
                TextIndexError::Database(format!("Failed to close database: {}", e))
            })?;
        }
        Ok(())
    }
}

fn validate_limit(limit: usize) -> Result<(), TextIndexError> {
    if (1..=MAX_SEARCH_LIMIT).contains(&limit) {
        Ok(())
    } else {
        Err(TextIndexError::InvalidLimit(limit))
    }
}

/// Maps the first seven columns of a row to a document.
fn document_from_row(row: &Row<'_>) -> rusqlite::Result<TextDocument> {
    let metadata_json: String = row.get(5)?;
    let metadata = serde_json::from_str::<Map<String, Value>>(&metadata_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(TextDocument {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        doc_type: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        metadata,
        updated_at: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
    })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
