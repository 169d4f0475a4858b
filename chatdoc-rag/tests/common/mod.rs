//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chatdoc_rag::persistence::LoadedRecords;
use chatdoc_rag::{
    DocumentRecord, EmbeddingProvider, InMemoryRecordStore, RagError, RecordStore,
    RetrievalConfig, RetrievalEngine, Result,
};

/// Words counted into the four embedding axes.
pub const VOCABULARY: [&str; 4] = ["apple", "banana", "cherry", "date"];

/// Deterministic bag-of-words embedder over [`VOCABULARY`].
///
/// Axis `i` holds the number of occurrences of `VOCABULARY[i]`. Text
/// containing `FAIL` is rejected, text containing `WIDE` gets an extra fifth
/// axis, and text containing `NAN` gets a NaN first axis.
#[derive(Default)]
pub struct KeywordEmbedder {
    calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    VOCABULARY
        .iter()
        .map(|word| {
            lower
                .split(|c: char| !c.is_alphanumeric())
                .filter(|token| token == word)
                .count() as f32
        })
        .collect()
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("FAIL") {
            return Err(RagError::EmbeddingError {
                provider: "keyword".into(),
                message: "refusing to embed".into(),
            });
        }
        let mut vector = keyword_vector(text);
        if text.contains("WIDE") {
            vector.push(1.0);
        }
        if text.contains("NAN") {
            vector[0] = f32::NAN;
        }
        Ok(vector)
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

/// Record store that fails writes or erases of records whose content
/// contains `marker`.
pub struct RejectingRecordStore {
    pub inner: InMemoryRecordStore,
    marker: String,
    reject_writes: bool,
    reject_erases: bool,
}

impl RejectingRecordStore {
    pub fn failing_writes(marker: &str) -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            marker: marker.to_string(),
            reject_writes: true,
            reject_erases: false,
        }
    }

    pub fn failing_erases(marker: &str) -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            marker: marker.to_string(),
            reject_writes: false,
            reject_erases: true,
        }
    }

    fn refused(id: &str, message: &str) -> RagError {
        RagError::PersistenceError { id: id.to_string(), message: message.to_string() }
    }
}

impl RecordStore for RejectingRecordStore {
    fn write(&self, record: &DocumentRecord) -> Result<()> {
        if self.reject_writes && record.content.contains(&self.marker) {
            return Err(Self::refused(&record.id, "disk full"));
        }
        self.inner.write(record)
    }

    fn erase(&self, id: &str) -> Result<()> {
        let marked = self.inner.get(id).is_some_and(|r| r.content.contains(&self.marker));
        if self.reject_erases && marked {
            return Err(Self::refused(id, "permission denied"));
        }
        self.inner.erase(id)
    }

    fn load_all(&self) -> Result<LoadedRecords> {
        self.inner.load_all()
    }
}

/// A permissive configuration: every candidate passes the threshold.
pub fn open_config() -> RetrievalConfig {
    RetrievalConfig::builder()
        .similarity_threshold(0.0)
        .chunk_size(200)
        .chunk_overlap(0)
        .build()
        .expect("valid config")
}

pub fn engine_with(
    config: RetrievalConfig,
    embedder: Arc<KeywordEmbedder>,
    records: Arc<dyn RecordStore>,
) -> RetrievalEngine {
    RetrievalEngine::builder()
        .config(config)
        .embedding_provider(embedder)
        .record_store(records)
        .build()
        .expect("engine builds")
}

pub fn memory_engine() -> (RetrievalEngine, Arc<KeywordEmbedder>, Arc<InMemoryRecordStore>) {
    let embedder = Arc::new(KeywordEmbedder::new());
    let records = Arc::new(InMemoryRecordStore::new());
    let engine = engine_with(open_config(), embedder.clone(), records.clone());
    (engine, embedder, records)
}
