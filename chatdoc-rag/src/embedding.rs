//! Embedding provider trait for turning text into vectors.

use async_trait::async_trait;

use crate::error::Result;

/// A provider that generates vector embeddings from text input.
///
/// The retrieval core treats the provider as an opaque function. It must be
/// deterministic enough that the same text yields directly comparable vectors
/// across calls, and every vector from one provider instance must have the
/// same length. Timeouts, retries, and quotas belong to the implementation.
///
/// The default [`embed_batch`](EmbeddingProvider::embed_batch) implementation
/// calls [`embed`](EmbeddingProvider::embed) sequentially; backends that
/// support native batching should override it.
///
/// # Example
///
/// ```rust,ignore
/// use chatdoc_rag::EmbeddingProvider;
///
/// let provider = MyEmbeddingProvider::new();
/// let embedding = provider.embed("hello world").await?;
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for a single text input.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::EmbeddingError`](crate::RagError::EmbeddingError)
    /// on network, quota, or input failures.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embedding vectors for a batch of text inputs.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// A short provider name used in log fields and error messages.
    fn name(&self) -> &str {
        "custom"
    }
}
