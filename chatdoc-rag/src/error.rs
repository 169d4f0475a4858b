//! Error types for the `chatdoc-rag` crate.

use thiserror::Error;

/// Errors that can occur in retrieval operations.
///
/// A missing document is never an error: lookups return `Option`, deletions
/// return `bool` or a count of zero.
#[derive(Debug, Error)]
pub enum RagError {
    /// The embedding provider failed to produce a vector.
    #[error("Embedding error ({provider}): {message}")]
    EmbeddingError {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// A vector's dimensionality differs from the one fixed for this index.
    ///
    /// This is a configuration problem and is never coerced.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The dimensionality established by the first embedding.
        expected: usize,
        /// The dimensionality that was offered.
        actual: usize,
    },

    /// Reading or writing a durable document record failed.
    #[error("Persistence error ({id}): {message}")]
    PersistenceError {
        /// The document ID (or path) the failure relates to.
        id: String,
        /// A description of the failure.
        message: String,
    },

    /// The chunker was called with invalid arguments.
    #[error("Chunking error: {0}")]
    ChunkingError(String),

    /// A configuration validation error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The vector index and document store disagree.
    #[error("Index error: {0}")]
    IndexError(String),
}

impl RagError {
    pub(crate) fn persistence(id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        RagError::PersistenceError { id: id.into(), message: message.to_string() }
    }

    /// Whether this error signals a misconfiguration that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RagError::DimensionMismatch { .. } | RagError::ConfigError(_))
    }
}

/// A convenience result type for retrieval operations.
pub type Result<T> = std::result::Result<T, RagError>;
