//! The authoritative document store.
//!
//! [`DocumentStore`] maps document IDs to [`Document`]s in insertion order and
//! owns the [`RecordStore`] that makes them durable. The in-memory map and the
//! durable records are updated by separate calls so the engine can order them
//! (and roll back) around index maintenance.
//!
//! Record I/O is blocking, so it runs on tokio's blocking pool and the async
//! methods must be called from within a runtime.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::document::Document;
use crate::error::{RagError, Result};
use crate::persistence::{DocumentRecord, RecordStore};

/// Insertion-ordered map of live documents plus their durable records.
///
/// Iteration order is insertion order, and removal preserves the relative
/// order of the survivors. The vector index relies on this: offset `i` in the
/// index is the `i`-th document of [`DocumentStore::iter`].
pub struct DocumentStore {
    documents: IndexMap<String, Document>,
    records: Arc<dyn RecordStore>,
    persist_embeddings: bool,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("documents", &self.documents.len())
            .field("persist_embeddings", &self.persist_embeddings)
            .finish()
    }
}

/// Run blocking record I/O off the async worker thread.
async fn run_blocking<T, F>(id: &str, task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| RagError::persistence(id, format!("record task failed: {e}")))?
}

impl DocumentStore {
    /// Create an empty store over `records`.
    ///
    /// When `persist_embeddings` is false, records are written without their
    /// vectors and must be re-embedded on load.
    pub fn new(records: Arc<dyn RecordStore>, persist_embeddings: bool) -> Self {
        Self { documents: IndexMap::new(), records, persist_embeddings }
    }

    /// Insert `document` if its ID is absent.
    ///
    /// Returns `false` without touching the existing document otherwise.
    pub fn put(&mut self, document: Document) -> bool {
        if self.documents.contains_key(&document.id) {
            debug!(document.id = %document.id, "duplicate document id rejected");
            return false;
        }
        self.documents.insert(document.id.clone(), document);
        true
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.documents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    /// Position of `id` in iteration order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.documents.get_index_of(id)
    }

    /// The document at iteration position `offset`.
    pub fn get_at(&self, offset: usize) -> Option<&Document> {
        self.documents.get_index(offset).map(|(_, doc)| doc)
    }

    /// Remove the in-memory document for `id`. Returns `false` if absent.
    ///
    /// The durable record is left alone; see [`DocumentStore::erase_persisted`].
    pub fn delete(&mut self, id: &str) -> bool {
        self.remove(id).is_some()
    }

    /// Remove and return the in-memory document for `id`.
    pub fn remove(&mut self, id: &str) -> Option<Document> {
        self.documents.shift_remove(id)
    }

    /// Remove every document whose `source` matches. Returns the count.
    pub fn delete_by_source(&mut self, source: &str) -> usize {
        self.delete_where(|doc| doc.source == source)
    }

    /// Remove every document in `partition_key`. Returns the count.
    pub fn delete_by_partition(&mut self, partition_key: &str) -> usize {
        self.delete_where(|doc| doc.partition_key.as_deref() == Some(partition_key))
    }

    /// Remove every document whose ID is in `ids`. Returns the count.
    pub fn delete_ids(&mut self, ids: &HashSet<String>) -> usize {
        self.delete_where(|doc| ids.contains(&doc.id))
    }

    fn delete_where(&mut self, predicate: impl Fn(&Document) -> bool) -> usize {
        let before = self.documents.len();
        self.documents.retain(|_, doc| !predicate(doc));
        before - self.documents.len()
    }

    /// IDs of the documents whose `source` matches, in iteration order.
    pub fn ids_by_source(&self, source: &str) -> Vec<String> {
        self.documents
            .values()
            .filter(|doc| doc.source == source)
            .map(|doc| doc.id.clone())
            .collect()
    }

    /// IDs of the documents in `partition_key`, in iteration order.
    pub fn ids_by_partition(&self, partition_key: &str) -> Vec<String> {
        self.list(Some(partition_key)).into_iter().map(|doc| doc.id.clone()).collect()
    }

    /// Documents in insertion order, optionally restricted to one partition.
    pub fn list(&self, partition_key: Option<&str>) -> Vec<&Document> {
        self.documents.values().filter(|doc| doc.in_partition(partition_key)).collect()
    }

    /// Number of documents in `partition_key` (or in total for `None`).
    pub fn count(&self, partition_key: Option<&str>) -> usize {
        match partition_key {
            None => self.documents.len(),
            Some(_) => {
                self.documents.values().filter(|doc| doc.in_partition(partition_key)).count()
            }
        }
    }

    /// All documents in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Drop every in-memory document. Durable records are untouched.
    pub fn clear(&mut self) {
        self.documents.clear();
    }

    /// Write the durable record for `document`, overwriting any existing one.
    pub async fn persist(&self, document: &Document) -> Result<()> {
        let record = DocumentRecord::from_document(document, self.persist_embeddings);
        let records = Arc::clone(&self.records);
        run_blocking(&document.id, move || records.write(&record)).await
    }

    /// Remove the durable record for `id`. Absence is not an error.
    pub async fn erase_persisted(&self, id: &str) -> Result<()> {
        let records = Arc::clone(&self.records);
        let owned = id.to_string();
        run_blocking(id, move || records.erase(&owned)).await
    }

    /// Read every durable record back into documents.
    ///
    /// Malformed records are skipped and logged. Documents whose records carry
    /// no embedding come back with an empty `embedding`.
    pub async fn load_all(&self) -> Result<Vec<Document>> {
        let records = Arc::clone(&self.records);
        let loaded = run_blocking("*", move || records.load_all()).await?;
        if !loaded.skipped.is_empty() {
            warn!(skipped = loaded.skipped.len(), "some document records could not be loaded");
        }
        Ok(loaded.records.into_iter().map(DocumentRecord::into_document).collect())
    }
}
