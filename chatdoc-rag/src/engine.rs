//! Retrieval engine orchestrator.
//!
//! The [`RetrievalEngine`] owns the [`DocumentStore`] and the [`FlatIndex`]
//! behind a single lock and coordinates ingestion (chunk → embed → store →
//! index) and query (embed → search → filter → rank).
//!
//! # Example
//!
//! ```rust,ignore
//! use chatdoc_rag::{JsonRecordStore, RetrievalConfig, RetrievalEngine};
//!
//! let engine = RetrievalEngine::builder()
//!     .config(RetrievalConfig::default())
//!     .embedding_provider(Arc::new(my_embedder))
//!     .record_store(Arc::new(JsonRecordStore::open("index_data")?))
//!     .build()?;
//!
//! engine.load_from_disk().await?;
//! engine.ingest_text(&text, "report.pdf", Some("chat-42"), None).await?;
//! let hits = engine.query("what changed?", Some("chat-42"), 5, 0.5).await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunking::{Chunker, SentenceChunker};
use crate::config::{RetrievalConfig, check_threshold};
use crate::document::{
    ChunkFailure, Document, DocumentSummary, FILE_TYPE_KEY, IndexStatistics, IngestReport,
    Metadata, ScoredDocument, file_type_for_source,
};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::index::FlatIndex;
use crate::persistence::RecordStore;
use crate::store::DocumentStore;

/// Everything guarded by the engine lock.
///
/// `index` offset `i` always holds the embedding of the `i`-th document of
/// `store`: inserts append to both, and every removal is followed by a full
/// rebuild from the store.
#[derive(Debug)]
struct EngineState {
    store: DocumentStore,
    index: FlatIndex,
    /// Fixed by the first successful embedding; survives the index emptying.
    dimension: Option<usize>,
}

/// Outcome of adding one embedded document under the lock.
enum AddOutcome {
    Added,
    Duplicate,
}

impl EngineState {
    fn check_dimension(&self, actual: usize) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(RagError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }

    /// Put, persist, and index one document, rolling back on failure.
    async fn add(&mut self, document: Document) -> Result<AddOutcome> {
        let dim = document.embedding.len();
        self.check_dimension(dim)?;

        let id = document.id.clone();
        let vector = document.embedding.clone();
        if !self.store.put(document) {
            return Ok(AddOutcome::Duplicate);
        }

        let persisted = match self.store.get(&id) {
            Some(stored) => self.store.persist(stored).await,
            None => Err(RagError::IndexError(format!("document '{id}' vanished after insert"))),
        };
        if let Err(e) = persisted {
            self.store.remove(&id);
            return Err(e);
        }

        if let Err(e) = self.index.insert(&vector) {
            self.store.remove(&id);
            if let Err(erase_err) = self.store.erase_persisted(&id).await {
                warn!(
                    document.id = %id,
                    error = %erase_err,
                    "failed to erase record after index rollback"
                );
            }
            return Err(e);
        }

        self.dimension.get_or_insert(dim);
        Ok(AddOutcome::Added)
    }

    /// Replace the index content with the store's embeddings, in store order.
    fn rebuild_index(&mut self) -> Result<()> {
        self.index.rebuild(self.store.iter().map(|doc| doc.embedding.as_slice()))?;
        debug!(vectors = self.index.len(), "rebuilt vector index");
        Ok(())
    }

    /// Erase the durable records of `ids`, then drop the erased documents from
    /// memory and rebuild the index.
    ///
    /// A document whose record cannot be erased stays live at its position, so
    /// memory and disk keep agreeing. The first such error is returned after
    /// the rest have been attempted.
    async fn remove_documents(&mut self, ids: Vec<String>) -> Result<usize> {
        let mut erased = HashSet::with_capacity(ids.len());
        let mut first_error = None;
        for id in ids {
            match self.store.erase_persisted(&id).await {
                Ok(()) => {
                    erased.insert(id);
                }
                Err(e) => {
                    error!(document.id = %id, error = %e, "failed to erase document record");
                    first_error.get_or_insert(e);
                }
            }
        }

        let removed = self.store.delete_ids(&erased);
        if removed > 0 {
            self.rebuild_index()?;
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Scan index candidates in ascending distance, keeping those that pass
    /// the threshold and belong to the partition.
    fn rank(
        &self,
        query: &[f32],
        partition_key: Option<&str>,
        top_k: usize,
        threshold: f32,
        overfetch_factor: usize,
        adaptive: bool,
    ) -> Result<Vec<ScoredDocument>> {
        let total = self.index.len();
        if total != self.store.len() {
            return Err(RagError::IndexError(format!(
                "index holds {total} vectors but store holds {} documents",
                self.store.len()
            )));
        }
        if total == 0 || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut window = top_k.saturating_mul(overfetch_factor).min(total);
        let mut scanned = 0;
        let mut kept = Vec::new();

        loop {
            let candidates = self.index.search(query, window)?;
            let mut below_threshold = false;

            for neighbor in &candidates[scanned..] {
                let similarity = neighbor.similarity();
                if similarity < threshold {
                    // Candidates arrive by ascending distance, so none further can pass.
                    below_threshold = true;
                    break;
                }
                let offset = neighbor.offset;
                let document = self.store.get_at(offset).ok_or_else(|| {
                    RagError::IndexError(format!("index offset {offset} has no document"))
                })?;
                if !document.in_partition(partition_key) {
                    continue;
                }
                kept.push(ScoredDocument { document: document.clone(), similarity });
                if kept.len() >= top_k {
                    break;
                }
            }
            scanned = candidates.len();

            if !adaptive || kept.len() >= top_k || below_threshold || window >= total {
                break;
            }
            window = window.saturating_mul(2).min(total);
            debug!(window, kept = kept.len(), "widening candidate window");
        }

        Ok(kept)
    }
}

/// The retrieval core: a partitioned, persistent vector index over passages.
///
/// Construct one at startup via [`RetrievalEngine::builder()`], call
/// [`load_from_disk`](RetrievalEngine::load_from_disk) before serving
/// queries, share it as `Arc<RetrievalEngine>`, and call
/// [`flush`](RetrievalEngine::flush) at shutdown.
///
/// The store and index sit behind one `RwLock`: mutations hold the write
/// guard for their whole critical section and searches hold the read guard,
/// so a search never observes a half-applied insert or overlaps a rebuild.
/// Embedding-provider calls for ingestion and queries run outside the guard.
pub struct RetrievalEngine {
    config: RetrievalConfig,
    embedding_provider: Arc<dyn EmbeddingProvider>,
    chunker: Arc<dyn Chunker>,
    state: RwLock<EngineState>,
}

impl RetrievalEngine {
    /// Create a new [`RetrievalEngineBuilder`].
    pub fn builder() -> RetrievalEngineBuilder {
        RetrievalEngineBuilder::default()
    }

    /// Return a reference to the engine configuration.
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Return a reference to the embedding provider.
    pub fn embedding_provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedding_provider
    }

    /// Embed `text`, normalizing provider failures into `EmbeddingError`.
    ///
    /// Empty vectors and vectors with NaN or infinite components are rejected.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let provider = self.embedding_provider.name();
        let rejected = |message: &str| RagError::EmbeddingError {
            provider: provider.to_string(),
            message: message.to_string(),
        };
        let vector = self.embedding_provider.embed(text).await.map_err(|e| match e {
            RagError::EmbeddingError { .. } => e,
            other => rejected(&other.to_string()),
        })?;
        if vector.is_empty() {
            return Err(rejected("provider returned an empty vector"));
        }
        if !vector.iter().all(|x| x.is_finite()) {
            return Err(rejected("provider returned a non-finite vector component"));
        }
        Ok(vector)
    }

    /// Ingest pre-chunked passages of one source.
    ///
    /// Each chunk gets a fresh ID, is embedded, and is then stored, persisted,
    /// and indexed as one unit. A chunk whose embedding or persistence fails is
    /// recorded in [`IngestReport::failures`] and the batch moves on. Every
    /// document's metadata is `metadata_template` plus `chunk_index` and
    /// `chunk_total`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::DimensionMismatch`] if the provider's vectors change
    /// length. Chunks added before the mismatch stay added.
    pub async fn ingest<S: AsRef<str> + Sync>(
        &self,
        chunks: &[S],
        source: &str,
        partition_key: Option<&str>,
        metadata_template: &Metadata,
    ) -> Result<IngestReport> {
        let started = Instant::now();
        let total = chunks.len();
        let mut document_ids = Vec::with_capacity(total);
        let mut failures = Vec::new();

        for (chunk_index, chunk) in chunks.iter().enumerate() {
            let content = chunk.as_ref();
            let embedding = match self.embed(content).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!(source, chunk_index, error = %e, "skipping chunk: embedding failed");
                    failures.push(ChunkFailure { chunk_index, reason: e.to_string() });
                    continue;
                }
            };

            let mut metadata = metadata_template.clone();
            metadata.insert("chunk_index".to_string(), json!(chunk_index));
            metadata.insert("chunk_total".to_string(), json!(total));
            let document = Document::with_id(
                Uuid::new_v4().to_string(),
                content,
                source,
                partition_key.map(String::from),
                metadata,
            )
            .with_embedding(embedding);
            let id = document.id.clone();

            let mut state = self.state.write().await;
            match state.add(document).await {
                Ok(AddOutcome::Added) => document_ids.push(id),
                Ok(AddOutcome::Duplicate) => {
                    warn!(document.id = %id, source, chunk_index, "skipping chunk: id collision");
                    failures.push(ChunkFailure {
                        chunk_index,
                        reason: format!("document id '{id}' already exists"),
                    });
                }
                Err(e) if e.is_fatal() => {
                    error!(
                        source,
                        chunk_index,
                        added = document_ids.len(),
                        error = %e,
                        "ingestion aborted"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        document.id = %id,
                        source,
                        chunk_index,
                        error = %e,
                        "skipping chunk: store failed"
                    );
                    failures.push(ChunkFailure { chunk_index, reason: e.to_string() });
                }
            }
        }

        let report = IngestReport {
            source: source.to_string(),
            partition_key: partition_key.map(String::from),
            requested: total,
            added: document_ids.len(),
            document_ids,
            failures,
            elapsed: started.elapsed(),
        };
        info!(
            source,
            partition = partition_key.unwrap_or("<global>"),
            requested = report.requested,
            added = report.added,
            "ingested chunks"
        );
        Ok(report)
    }

    /// Chunk extracted text with the configured chunker, then [`ingest`](Self::ingest) it.
    ///
    /// The metadata template records `chunk_size`, `overlap`, `chunk_count`,
    /// `original_size` (characters), and `file_type` (given, or derived from
    /// the source's extension).
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ChunkingError`] if the text yields no chunks, plus
    /// anything [`ingest`](Self::ingest) returns.
    pub async fn ingest_text(
        &self,
        text: &str,
        source: &str,
        partition_key: Option<&str>,
        file_type: Option<&str>,
    ) -> Result<IngestReport> {
        let chunks = self.chunker.chunk(text);
        if chunks.is_empty() {
            return Err(RagError::ChunkingError(format!(
                "no chunks could be created from the text of '{source}'"
            )));
        }

        let mut template = Metadata::new();
        template.insert("chunk_size".to_string(), json!(self.chunker.chunk_size()));
        template.insert("overlap".to_string(), json!(self.chunker.overlap()));
        template.insert("chunk_count".to_string(), json!(chunks.len()));
        template.insert("original_size".to_string(), json!(text.chars().count()));
        let file_type = file_type
            .map(|t| t.trim_start_matches('.').to_ascii_lowercase())
            .or_else(|| file_type_for_source(source));
        if let Some(file_type) = file_type {
            template.insert(FILE_TYPE_KEY.to_string(), json!(file_type));
        }

        self.ingest(&chunks, source, partition_key, &template).await
    }

    /// Return up to `top_k` passages at least `similarity_threshold` similar
    /// to `text`, optionally restricted to one partition.
    ///
    /// Results are ordered by non-increasing similarity. An empty store (or
    /// empty partition) returns an empty list without calling the provider.
    ///
    /// Candidates are fetched from the index as `top_k * overfetch_factor`
    /// nearest vectors and filtered by partition afterwards, so a partition
    /// that is sparse relative to the whole corpus can miss true matches
    /// beyond that window unless `adaptive_overfetch` is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if `similarity_threshold` is NaN or
    /// outside `[0, 1]`, [`RagError::EmbeddingError`] if the query cannot be
    /// embedded, and [`RagError::DimensionMismatch`] if its vector has the
    /// wrong length.
    pub async fn query(
        &self,
        text: &str,
        partition_key: Option<&str>,
        top_k: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<ScoredDocument>> {
        check_threshold(similarity_threshold)?;
        if top_k == 0 || self.state.read().await.store.count(partition_key) == 0 {
            debug!(partition = partition_key.unwrap_or("<global>"), "query against empty scope");
            return Ok(Vec::new());
        }

        let query_vector = self.embed(text).await.inspect_err(|e| {
            error!(error = %e, "embedding failed during query");
        })?;

        let state = self.state.read().await;
        let results = state.rank(
            &query_vector,
            partition_key,
            top_k,
            similarity_threshold,
            self.config.overfetch_factor,
            self.config.adaptive_overfetch,
        )?;

        info!(
            partition = partition_key.unwrap_or("<global>"),
            top_k,
            result_count = results.len(),
            "query completed"
        );
        Ok(results)
    }

    /// [`query`](Self::query) with the configured `top_k` and threshold.
    pub async fn search(
        &self,
        text: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<ScoredDocument>> {
        self.query(text, partition_key, self.config.top_k, self.config.similarity_threshold).await
    }

    /// Delete one document and its record, then rebuild the index.
    ///
    /// Returns `false` if no document has this ID.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::PersistenceError`] if the record cannot be erased;
    /// the document then stays live.
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.store.contains(id) {
            return Ok(false);
        }
        let removed = state.remove_documents(vec![id.to_string()]).await?;
        info!(document.id = %id, "deleted document");
        Ok(removed == 1)
    }

    /// Delete every document of one partition, then rebuild the index.
    ///
    /// Returns the number removed; zero is not an error.
    ///
    /// # Errors
    ///
    /// Returns the first [`RagError::PersistenceError`]. Documents whose
    /// records could not be erased stay live in their original order.
    pub async fn delete_by_partition(&self, partition_key: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let ids = state.store.ids_by_partition(partition_key);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = state.remove_documents(ids).await?;
        info!(partition = partition_key, removed = count, "deleted partition documents");
        Ok(count)
    }

    /// Delete every document of one source, then rebuild the index.
    ///
    /// Returns the number removed; zero is not an error. Errors as for
    /// [`delete_by_partition`](Self::delete_by_partition).
    pub async fn delete_by_source(&self, source: &str) -> Result<usize> {
        let mut state = self.state.write().await;
        let ids = state.store.ids_by_source(source);
        if ids.is_empty() {
            return Ok(0);
        }
        let count = state.remove_documents(ids).await?;
        info!(source, removed = count, "deleted source documents");
        Ok(count)
    }

    /// Replace the in-memory state with every durable record.
    ///
    /// Records without a stored embedding are re-embedded (and re-persisted
    /// when `persist_embeddings` is on); a record that cannot be re-embedded
    /// is skipped with a warning. The index is rebuilt in store order.
    /// Returns the number of live documents.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::PersistenceError`] if the record store cannot be
    /// enumerated and [`RagError::DimensionMismatch`] if records disagree on
    /// vector length. The previous state is kept on error.
    pub async fn load_from_disk(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let loaded = state.store.load_all().await?;

        let mut prepared = Vec::with_capacity(loaded.len());
        let mut reembedded = Vec::new();
        let mut dimension = None;
        for mut document in loaded {
            if document.embedding.is_empty() {
                match self.embed(&document.content).await {
                    Ok(embedding) => {
                        document.embedding = embedding;
                        reembedded.push(document.id.clone());
                    }
                    Err(e) => {
                        warn!(
                            document.id = %document.id,
                            error = %e,
                            "skipping record: re-embedding failed"
                        );
                        continue;
                    }
                }
            }
            let actual = document.embedding.len();
            match dimension {
                Some(expected) if expected != actual => {
                    error!(
                        document.id = %document.id,
                        expected,
                        actual,
                        "record dimension mismatch"
                    );
                    return Err(RagError::DimensionMismatch { expected, actual });
                }
                _ => dimension = Some(actual),
            }
            prepared.push(document);
        }

        state.store.clear();
        for document in prepared {
            state.store.put(document);
        }
        state.dimension = dimension;
        state.rebuild_index()?;

        if self.config.persist_embeddings {
            for id in &reembedded {
                if let Some(document) = state.store.get(id) {
                    if let Err(e) = state.store.persist(document).await {
                        warn!(document.id = %id, error = %e, "failed to backfill embedding");
                    }
                }
            }
        }

        let count = state.store.len();
        info!(documents = count, reembedded = reembedded.len(), "loaded documents from disk");
        Ok(count)
    }

    /// Document count and per-file-type counts, optionally for one partition.
    pub async fn statistics(&self, partition_key: Option<&str>) -> IndexStatistics {
        let state = self.state.read().await;
        let mut stats = IndexStatistics::default();
        for document in state.store.list(partition_key) {
            stats.document_count += 1;
            *stats.file_types.entry(document.file_type()).or_insert(0) += 1;
        }
        stats
    }

    /// Fetch one document by ID.
    pub async fn get_document(&self, id: &str) -> Option<Document> {
        self.state.read().await.store.get(id).cloned()
    }

    /// Content-free listing of documents, optionally for one partition.
    pub async fn list_documents(&self, partition_key: Option<&str>) -> Vec<DocumentSummary> {
        let state = self.state.read().await;
        state.store.list(partition_key).into_iter().map(Document::summary).collect()
    }

    /// Total number of live documents.
    pub async fn len(&self) -> usize {
        self.state.read().await.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.store.is_empty()
    }

    /// The embedding dimension, once established.
    pub async fn dimension(&self) -> Option<usize> {
        self.state.read().await.dimension
    }

    /// Re-persist every live document. Call at shutdown.
    ///
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns the first [`RagError::PersistenceError`]; remaining documents
    /// are still attempted.
    pub async fn flush(&self) -> Result<usize> {
        let state = self.state.read().await;
        let mut written = 0;
        let mut first_error = None;
        for document in state.store.iter() {
            match state.store.persist(document).await {
                Ok(()) => written += 1,
                Err(e) => {
                    error!(document.id = %document.id, error = %e, "failed to flush document");
                    first_error.get_or_insert(e);
                }
            }
        }
        info!(written, "flushed document records");
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}

/// Builder for constructing a [`RetrievalEngine`].
///
/// `embedding_provider` and `record_store` are required. `config` defaults to
/// [`RetrievalConfig::default()`] and `chunker` to a [`SentenceChunker`] built
/// from the config.
///
/// # Example
///
/// ```rust,ignore
/// let engine = RetrievalEngine::builder()
///     .config(config)
///     .embedding_provider(Arc::new(embedder))
///     .record_store(Arc::new(InMemoryRecordStore::new()))
///     .build()?;
/// ```
#[derive(Default)]
pub struct RetrievalEngineBuilder {
    config: Option<RetrievalConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    chunker: Option<Arc<dyn Chunker>>,
    record_store: Option<Arc<dyn RecordStore>>,
}

impl RetrievalEngineBuilder {
    /// Set the engine configuration.
    pub fn config(mut self, config: RetrievalConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Override the chunker used by [`RetrievalEngine::ingest_text`].
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Set the durable record backend.
    pub fn record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.record_store = Some(records);
        self
    }

    /// Build the [`RetrievalEngine`], validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if a required field is missing or the
    /// configuration is invalid.
    pub fn build(self) -> Result<RetrievalEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let embedding_provider = self
            .embedding_provider
            .ok_or_else(|| RagError::ConfigError("embedding_provider is required".to_string()))?;
        let record_store = self
            .record_store
            .ok_or_else(|| RagError::ConfigError("record_store is required".to_string()))?;
        let chunker = match self.chunker {
            Some(chunker) => chunker,
            None => Arc::new(
                SentenceChunker::new(config.chunk_size, config.chunk_overlap)
                    .map_err(|e| RagError::ConfigError(e.to_string()))?,
            ),
        };

        let state = EngineState {
            store: DocumentStore::new(record_store, config.persist_embeddings),
            index: FlatIndex::new(),
            dimension: None,
        };

        Ok(RetrievalEngine { config, embedding_provider, chunker, state: RwLock::new(state) })
    }
}
