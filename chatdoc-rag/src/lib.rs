//! # chatdoc-rag
//!
//! The retrieval core of a retrieval-augmented chat backend: a mutable,
//! conversation-partitioned vector index over text passages with durable
//! per-document persistence.
//!
//! ## Overview
//!
//! - [`SentenceChunker`] / [`chunk_text`] split extracted text into bounded,
//!   overlapping passages.
//! - [`EmbeddingProvider`] turns text into vectors (an OpenAI-backed provider
//!   is available with the `openai` feature).
//! - [`DocumentStore`] is the source of truth for passages and writes them
//!   through a [`RecordStore`] ([`JsonRecordStore`] on disk,
//!   [`InMemoryRecordStore`] for tests).
//! - [`FlatIndex`] performs exact squared-Euclidean nearest-neighbor search and
//!   is rebuilt from the store after every deletion.
//! - [`RetrievalEngine`] ties them together behind one lock.
//!
//! ## Features
//!
//! - `openai`: [`OpenAIEmbeddingProvider`](openai::OpenAIEmbeddingProvider)

pub mod chunking;
pub mod config;
pub mod document;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod persistence;
pub mod store;

#[cfg(feature = "openai")]
pub mod openai;

pub use chunking::{Chunker, SentenceChunker, chunk_text};
pub use config::{RetrievalConfig, RetrievalConfigBuilder};
pub use document::{
    ChunkFailure, Document, DocumentSummary, IndexStatistics, IngestReport, Metadata,
    ScoredDocument,
};
pub use embedding::EmbeddingProvider;
pub use engine::{RetrievalEngine, RetrievalEngineBuilder};
pub use error::{RagError, Result};
pub use index::{FlatIndex, Neighbor};
pub use persistence::{DocumentRecord, InMemoryRecordStore, JsonRecordStore, RecordStore};
pub use store::DocumentStore;

#[cfg(feature = "openai")]
pub use openai::OpenAIEmbeddingProvider;
