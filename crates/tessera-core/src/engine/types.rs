//! Documents, queries and results exchanged with the [`Engine`](super::Engine).

use crate::error::{EngineError, TextIndexError};
use crate::text::TextDocument;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Kind of source a document was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    #[serde(rename = "table")]
    TableRow,
    #[serde(rename = "file")]
    File,
    #[serde(rename = "record")]
    Record,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::TableRow => "table",
            DocumentType::File => "file",
            DocumentType::Record => "record",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(DocumentType::TableRow),
            "file" => Ok(DocumentType::File),
            "record" => Ok(DocumentType::Record),
            other => Err(format!("unknown document type: {}", other)),
        }
    }
}

/// The unit of indexing. Identity is `id`; indexing an existing id replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub doc_type: DocumentType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Embedding; documents without one are only reachable by text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f64>>,
    /// Milliseconds since the Unix epoch of the last index write. Filled in on
    /// documents returned by the engine.
    #[serde(default)]
    pub timestamp: i64,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        doc_type: DocumentType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            doc_type,
            title: String::new(),
            content: content.into(),
            metadata: Map::new(),
            vector: None,
            timestamp: 0,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_vector(mut self, vector: Vec<f64>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn to_text(&self) -> TextDocument {
        TextDocument {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            doc_type: self.doc_type.as_str().to_string(),
            title: self.title.clone(),
            content: self.content.clone(),
            metadata: self.metadata.clone(),
            updated_at: 0,
        }
    }
}

impl TryFrom<TextDocument> for Document {
    type Error = EngineError;

    fn try_from(doc: TextDocument) -> Result<Self, Self::Error> {
        let doc_type = doc
            .doc_type
            .parse::<DocumentType>()
            .map_err(|e: String| TextIndexError::Serialization(format!("{} ({})", e, doc.id)))?;
        Ok(Self {
            id: doc.id,
            tenant_id: doc.tenant_id,
            doc_type,
            title: doc.title,
            content: doc.content,
            metadata: doc.metadata,
            vector: None,
            timestamp: doc.updated_at,
        })
    }
}

/// Which retrieval path a [`Query`] takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[default]
    FullText,
    Vector,
    Hybrid,
    /// Reserved for direct queries against the backing store.
    Structured,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    pub text: String,
    pub vector: Option<Vec<f64>>,
    pub query_type: QueryType,
    /// Empty searches every tenant.
    pub tenant_id: String,
    /// Zero means the engine default.
    pub limit: usize,
    pub offset: usize,
}

impl Query {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            query_type: QueryType::FullText,
            ..Default::default()
        }
    }

    pub fn vector(vector: Vec<f64>) -> Self {
        Self {
            vector: Some(vector),
            query_type: QueryType::Vector,
            ..Default::default()
        }
    }

    pub fn hybrid(text: impl Into<String>, vector: Vec<f64>) -> Self {
        Self {
            text: text.into(),
            vector: Some(vector),
            query_type: QueryType::Hybrid,
            ..Default::default()
        }
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// One page of ranked documents with parallel scores, best first.
///
/// Scores are higher-is-better for every query type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResults {
    pub documents: Vec<Document>,
    pub scores: Vec<f64>,
    /// Ranked candidates before `offset`/`limit` were applied.
    pub total: usize,
    pub query_time: Duration,
}

impl SearchResults {
    pub fn ids(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_type_strings() {
        for t in [DocumentType::TableRow, DocumentType::File, DocumentType::Record] {
            assert_eq!(t.as_str().parse::<DocumentType>().unwrap(), t);
        }
        assert!("folder".parse::<DocumentType>().is_err());
        assert_eq!(
            serde_json::to_string(&DocumentType::TableRow).unwrap(),
            "\"table\""
        );
    }

    #[test]
    fn test_document_json_shape() {
        let doc: Document = serde_json::from_str(
            r#"{"id": "a", "tenant_id": "t1", "type": "record", "content": "refund policy", "vector": [1.0, 0.0]}"#,
        )
        .unwrap();
        assert_eq!(doc.doc_type, DocumentType::Record);
        assert_eq!(doc.vector, Some(vec![1.0, 0.0]));
        assert!(doc.title.is_empty());
        assert_eq!(doc.timestamp, 0);
    }

    #[test]
    fn test_text_document_conversion() {
        let doc = Document::new("a", "t1", DocumentType::File, "body")
            .with_title("Title")
            .with_metadata("path", "/docs/a.md");
        let mut text = doc.to_text();
        assert_eq!(text.doc_type, "file");

        text.updated_at = 42;
        let back = Document::try_from(text.clone()).unwrap();
        assert_eq!(back.timestamp, 42);
        assert_eq!(back.metadata, doc.metadata);

        text.doc_type = "folder".to_string();
        assert!(Document::try_from(text).is_err());
    }
}
