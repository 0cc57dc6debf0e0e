//! Embedding backend trait.

use ndarray::Array1;

use campuskb_core::Result;

/// Result of an embedding operation.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embedding: Array1<f32>,
    /// Whether this was served from cache.
    pub cached: bool,
}

/// Trait for embedding backends.
///
/// Failures surface as `Error::IndexUnavailable`: without embeddings the index
/// cannot be queried.
pub trait EmbedderBackend: Send + Sync {
    fn embed(&self, text: &str) -> Result<EmbeddingResult>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<EmbeddingResult>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize;

    /// Identifies the model. Stored embeddings from another version are recomputed.
    fn model_version(&self) -> String;
}
