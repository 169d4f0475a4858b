//! Durable document records.
//!
//! Each [`Document`] is persisted as one self-contained record keyed by its
//! ID. [`JsonRecordStore`] keeps one JSON file per document under
//! `<data_dir>/documents/`; [`InMemoryRecordStore`] keeps records in a map
//! and is meant for tests and ephemeral deployments.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::document::{Document, Metadata};
use crate::error::{RagError, Result};

/// Name of the subdirectory holding document records.
pub const DOCUMENTS_DIR: &str = "documents";

const RECORD_EXTENSION: &str = "json";

/// The on-disk form of a [`Document`].
///
/// `embedding` is optional: storing it avoids recomputation on reload at the
/// cost of space. A record without one is re-embedded before it is searchable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub content: String,
    pub source: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl DocumentRecord {
    /// Build a record from a document, optionally carrying its embedding.
    pub fn from_document(document: &Document, include_embedding: bool) -> Self {
        let embedding = (include_embedding && !document.embedding.is_empty())
            .then(|| document.embedding.clone());
        Self {
            id: document.id.clone(),
            content: document.content.clone(),
            source: document.source.clone(),
            metadata: document.metadata.clone(),
            created_at: document.created_at,
            partition_key: document.partition_key.clone(),
            embedding,
        }
    }

    /// Reconstruct the document. A missing embedding becomes an empty vector.
    pub fn into_document(self) -> Document {
        Document {
            id: self.id,
            content: self.content,
            source: self.source,
            metadata: self.metadata,
            partition_key: self.partition_key,
            created_at: self.created_at,
            embedding: self.embedding.unwrap_or_default(),
        }
    }
}

/// A record that could not be loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    /// File name or key of the record.
    pub location: String,
    pub reason: String,
}

/// Result of enumerating every durable record.
#[derive(Debug, Clone, Default)]
pub struct LoadedRecords {
    pub records: Vec<DocumentRecord>,
    pub skipped: Vec<SkippedRecord>,
}

/// Durable storage for document records, keyed by document ID.
///
/// Implementations must make `write` an overwrite and treat erasing an
/// absent record as success.
pub trait RecordStore: Send + Sync {
    /// Write one record, replacing any existing record with the same ID.
    fn write(&self, record: &DocumentRecord) -> Result<()>;

    /// Remove the record for `id`. Absence is not an error.
    fn erase(&self, id: &str) -> Result<()>;

    /// Read every record. Individual malformed records are reported in
    /// [`LoadedRecords::skipped`] rather than failing the whole load.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::PersistenceError`] only when the store itself
    /// cannot be enumerated.
    fn load_all(&self) -> Result<LoadedRecords>;
}

/// Reject IDs that could escape the records directory.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.chars().any(char::is_control)
    {
        return Err(RagError::persistence(id, "document id is not a valid record name"));
    }
    Ok(())
}

/// One pretty-printed JSON file per document under `<data_dir>/documents/`.
///
/// Writes go to a temporary file that is renamed over the target, so a record
/// is never observed half-written. Only `*.json` files are enumerated on load.
///
/// # Example
///
/// ```rust,ignore
/// use chatdoc_rag::JsonRecordStore;
///
/// let records = JsonRecordStore::open("index_data")?;
/// ```
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    dir: PathBuf,
}

impl JsonRecordStore {
    /// Open (creating if needed) the record directory under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::PersistenceError`] if the directory cannot be created.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join(DOCUMENTS_DIR);
        fs::create_dir_all(&dir)
            .map_err(|e| RagError::persistence(dir.display().to_string(), e))?;
        debug!(dir = %dir.display(), "opened document record directory");
        Ok(Self { dir })
    }

    /// The directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    fn read_record(path: &Path) -> std::result::Result<DocumentRecord, String> {
        let bytes = fs::read(path).map_err(|e| format!("read failed: {e}"))?;
        let record: DocumentRecord =
            serde_json::from_slice(&bytes).map_err(|e| format!("malformed record: {e}"))?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if stem != record.id {
            return Err(format!("record id '{}' does not match file name", record.id));
        }
        Ok(record)
    }
}

impl RecordStore for JsonRecordStore {
    fn write(&self, record: &DocumentRecord) -> Result<()> {
        validate_id(&record.id)?;
        let target = self.record_path(&record.id);
        let tmp = self.dir.join(format!(".{}.tmp", record.id));

        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| RagError::persistence(&record.id, e))?;
        let write_tmp = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, &target)
        };
        write_tmp().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            RagError::persistence(&record.id, e)
        })
    }

    fn erase(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RagError::persistence(id, e)),
        }
    }

    fn load_all(&self) -> Result<LoadedRecords> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LoadedRecords::default()),
            Err(e) => return Err(RagError::persistence(self.dir.display().to_string(), e)),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
            })
            .collect();
        // read_dir order is platform-defined; sort so reloads are reproducible.
        paths.sort();

        let mut loaded = LoadedRecords::default();
        for path in paths {
            match Self::read_record(&path) {
                Ok(record) => loaded.records.push(record),
                Err(reason) => {
                    let location = path.display().to_string();
                    warn!(record = %location, %reason, "skipping unreadable document record");
                    loaded.skipped.push(SkippedRecord { location, reason });
                }
            }
        }
        // Records carry their creation time; restore ingestion order from it.
        loaded.records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(loaded)
    }
}

/// Volatile [`RecordStore`] backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<String, DocumentRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch a copy of the record for `id`.
    pub fn get(&self, id: &str) -> Option<DocumentRecord> {
        self.records.read().ok()?.get(id).cloned()
    }

    fn poisoned(id: &str) -> RagError {
        RagError::persistence(id, "record map lock poisoned")
    }
}

impl RecordStore for InMemoryRecordStore {
    fn write(&self, record: &DocumentRecord) -> Result<()> {
        let mut records = self.records.write().map_err(|_| Self::poisoned(&record.id))?;
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn erase(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().map_err(|_| Self::poisoned(id))?;
        records.remove(id);
        Ok(())
    }

    fn load_all(&self) -> Result<LoadedRecords> {
        let records = self.records.read().map_err(|_| Self::poisoned("*"))?;
        let mut loaded: Vec<DocumentRecord> = records.values().cloned().collect();
        loaded.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(LoadedRecords { records: loaded, skipped: Vec::new() })
    }
}
