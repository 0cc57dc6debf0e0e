//! CampusKB Infer — embedding backends and query cache.
//!
//! `EmbedderBackend` abstracts over embedding generation. The built-in
//! `HashingEmbedder` is deterministic and needs no model files, which keeps
//! indexes reproducible across restarts.

pub mod cache;
pub mod embedder;
pub mod hashing;

pub use cache::{QueryCache, TtlCache};
pub use embedder::{EmbedderBackend, EmbeddingResult};
pub use hashing::HashingEmbedder;

use std::sync::Arc;
use std::time::Duration;

use campuskb_core::IndexConfig;

/// Create the embedder for an index configuration.
pub fn create_embedder(config: &IndexConfig) -> Arc<dyn EmbedderBackend> {
    let cache = QueryCache::new(1000, Duration::from_secs(3600));
    let embedder = HashingEmbedder::new(config.embedding_dim).with_cache(cache);
    tracing::info!(
        "Using hashing embedder (dim={}, version={})",
        embedder.dimension(),
        embedder.model_version()
    );
    Arc::new(embedder)
}
