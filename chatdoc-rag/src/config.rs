//! Configuration for the retrieval engine.

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Configuration parameters for the [`RetrievalEngine`](crate::RetrievalEngine).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Maximum number of words borrowed from the next chunk.
    pub chunk_overlap: usize,
    /// Number of results returned by [`search`](crate::RetrievalEngine::search).
    pub top_k: usize,
    /// Minimum similarity for a result to be kept (inclusive).
    pub similarity_threshold: f32,
    /// Multiplier applied to `top_k` when fetching candidates from the index,
    /// to leave room for partition filtering.
    pub overfetch_factor: usize,
    /// Keep widening the candidate window until `top_k` partition matches are
    /// found or the index is exhausted, instead of stopping at
    /// `top_k * overfetch_factor`.
    pub adaptive_overfetch: bool,
    /// Store embeddings in durable records so reloads skip re-embedding.
    pub persist_embeddings: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 100,
            top_k: 10,
            similarity_threshold: 0.5,
            overfetch_factor: 3,
            adaptive_overfetch: false,
            persist_embeddings: true,
        }
    }
}

impl RetrievalConfig {
    /// Create a new builder for constructing a [`RetrievalConfig`].
    pub fn builder() -> RetrievalConfigBuilder {
        RetrievalConfigBuilder::default()
    }

    /// Check that the parameters are usable.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if:
    /// - `chunk_size == 0`
    /// - `top_k == 0`
    /// - `overfetch_factor == 0`
    /// - `similarity_threshold` is not within `[0, 1]`
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::ConfigError("chunk_size must be greater than zero".to_string()));
        }
        if self.top_k == 0 {
            return Err(RagError::ConfigError("top_k must be greater than zero".to_string()));
        }
        if self.overfetch_factor == 0 {
            return Err(RagError::ConfigError(
                "overfetch_factor must be greater than zero".to_string(),
            ));
        }
        check_threshold(self.similarity_threshold)
    }
}

/// Reject similarity thresholds outside `[0, 1]`, including NaN.
pub(crate) fn check_threshold(threshold: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(RagError::ConfigError(format!(
            "similarity_threshold ({threshold}) must be within [0, 1]"
        )));
    }
    Ok(())
}

/// Builder for constructing a validated [`RetrievalConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetrievalConfigBuilder {
    config: RetrievalConfig,
}

impl RetrievalConfigBuilder {
    /// Set the maximum chunk size in characters.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the number of overlap words between consecutive chunks.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set the default number of results.
    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k;
        self
    }

    /// Set the default minimum similarity.
    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.config.similarity_threshold = threshold;
        self
    }

    /// Set the candidate overfetch multiplier.
    pub fn overfetch_factor(mut self, factor: usize) -> Self {
        self.config.overfetch_factor = factor;
        self
    }

    /// Enable or disable adaptive candidate windows.
    pub fn adaptive_overfetch(mut self, enabled: bool) -> Self {
        self.config.adaptive_overfetch = enabled;
        self
    }

    /// Choose whether durable records carry embeddings.
    pub fn persist_embeddings(mut self, enabled: bool) -> Self {
        self.config.persist_embeddings = enabled;
        self
    }

    /// Build the [`RetrievalConfig`], validating it.
    ///
    /// # Errors
    ///
    /// See [`RetrievalConfig::validate`].
    pub fn build(self) -> Result<RetrievalConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
