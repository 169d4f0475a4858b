//! Data types for passages, query hits, and ingestion reports.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Open key-value metadata attached to a [`Document`].
///
/// Values are JSON scalars in practice (chunk position, file type, sizes).
pub type Metadata = HashMap<String, serde_json::Value>;

/// Metadata key holding the file type used by [`IndexStatistics`].
pub const FILE_TYPE_KEY: &str = "file_type";

/// File type reported for documents without a `file_type` metadata entry.
pub const UNKNOWN_FILE_TYPE: &str = "unknown";

/// One indexed text passage: a chunk of a source file, not the whole file.
///
/// Documents are immutable once stored. They are only ever deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Unique identifier, generated at creation.
    pub id: String,
    /// The passage text.
    pub content: String,
    /// Identifier of the originating file or object.
    pub source: String,
    /// Chunk position, chunk count, file type, original size, and so on.
    pub metadata: Metadata,
    /// Conversation the passage belongs to. `None` means global.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// The passage embedding. Empty until the passage has been embedded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

impl Document {
    /// Create a passage with a fresh UUID and the current timestamp.
    pub fn new(
        content: impl Into<String>,
        source: impl Into<String>,
        partition_key: Option<String>,
        metadata: Metadata,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), content, source, partition_key, metadata)
    }

    /// Create a passage with a caller-chosen ID.
    pub fn with_id(
        id: impl Into<String>,
        content: impl Into<String>,
        source: impl Into<String>,
        partition_key: Option<String>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            source: source.into(),
            metadata,
            partition_key,
            created_at: Utc::now(),
            embedding: Vec::new(),
        }
    }

    /// Attach an embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    /// Whether this passage belongs to `partition_key`.
    ///
    /// `None` matches every document.
    pub fn in_partition(&self, partition_key: Option<&str>) -> bool {
        match partition_key {
            Some(key) => self.partition_key.as_deref() == Some(key),
            None => true,
        }
    }

    /// The `file_type` metadata entry, or `"unknown"`.
    pub fn file_type(&self) -> String {
        match self.metadata.get(FILE_TYPE_KEY) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => UNKNOWN_FILE_TYPE.to_string(),
            Some(other) => other.to_string(),
        }
    }

    /// A content-free listing entry for this passage.
    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            source: self.source.clone(),
            metadata: self.metadata.clone(),
            partition_key: self.partition_key.clone(),
            created_at: self.created_at,
        }
    }
}

/// Derive a file type from a source name's extension, lowercased.
pub fn file_type_for_source(source: &str) -> Option<String> {
    Path::new(source).extension().and_then(|ext| ext.to_str()).map(|ext| ext.to_ascii_lowercase())
}

/// A listing entry: everything about a [`Document`] except its text and vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentSummary {
    pub id: String,
    pub source: String,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A retrieved [`Document`] paired with its similarity to the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDocument {
    /// The retrieved passage.
    pub document: Document,
    /// `1 / (1 + squared_distance)`, in `(0, 1]`. Higher is more relevant.
    pub similarity: f32,
}

/// Document counts, optionally scoped to one partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStatistics {
    /// Number of documents in scope.
    pub document_count: usize,
    /// Count of documents per `file_type` metadata value.
    pub file_types: BTreeMap<String, usize>,
}

/// A chunk that was not added during ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkFailure {
    /// Position of the chunk in the ingested sequence.
    pub chunk_index: usize,
    /// Why the chunk was not added.
    pub reason: String,
}

/// Outcome of one ingestion batch.
///
/// `added < requested` signals partial success; `failures` says why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestReport {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    /// Number of chunks offered.
    pub requested: usize,
    /// Number of chunks that became searchable documents.
    pub added: usize,
    /// IDs of the added documents, in chunk order.
    pub document_ids: Vec<String>,
    pub failures: Vec<ChunkFailure>,
    /// Wall-clock processing time.
    pub elapsed: Duration,
}

impl IngestReport {
    /// Whether every offered chunk was added.
    pub fn is_complete(&self) -> bool {
        self.added == self.requested
    }
}
