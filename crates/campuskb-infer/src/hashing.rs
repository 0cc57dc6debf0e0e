//! Feature-hashing embedder.
//!
//! Stemmed content terms (weight 1.0) and adjacent-term bigrams (weight 0.5)
//! are hashed with SHA-256 into signed buckets, then L2-normalized. No model
//! files, fully deterministic, and terms shared by query and chunk always land
//! in the same bucket.

use ndarray::Array1;
use sha2::{Digest, Sha256};

use campuskb_core::text::content_terms;
use campuskb_core::{Error, Result};

use crate::cache::QueryCache;
use crate::embedder::{EmbedderBackend, EmbeddingResult};

const UNIGRAM_WEIGHT: f32 = 1.0;
const BIGRAM_WEIGHT: f32 = 0.5;

pub struct HashingEmbedder {
    dim: usize,
    cache: Option<QueryCache>,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim, cache: None }
    }

    pub fn with_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn compute(&self, text: &str) -> Array1<f32> {
        let mut vector = Array1::<f32>::zeros(self.dim);
        let terms = content_terms(text);

        for term in &terms {
            self.accumulate(&mut vector, "u", term, UNIGRAM_WEIGHT);
        }
        for pair in terms.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, "b", &bigram, BIGRAM_WEIGHT);
        }

        let norm = vector.dot(&vector).sqrt();
        if norm > 1e-9 {
            vector /= norm;
        }
        vector
    }

    fn accumulate(&self, vector: &mut Array1<f32>, kind: &str, feature: &str, weight: f32) {
        let digest = Sha256::new()
            .chain_update(kind.as_bytes())
            .chain_update([0u8])
            .chain_update(feature.as_bytes())
            .finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(head);

        let bucket = (h % self.dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl EmbedderBackend for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<EmbeddingResult> {
        if self.dim == 0 {
            return Err(Error::IndexUnavailable("embedder has zero dimension".into()));
        }
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.get(text)) {
            return Ok(EmbeddingResult {
                embedding: hit,
                cached: true,
            });
        }

        let embedding = self.compute(text);
        if let Some(cache) = &self.cache {
            cache.put(text.to_string(), embedding.clone());
        }
        Ok(EmbeddingResult {
            embedding,
            cached: false,
        })
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_version(&self) -> String {
        format!("hash-embedder-v1/{}", self.dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cosine(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
        a.dot(b)
    }

    #[test]
    fn test_deterministic_and_normalized() {
        let e = HashingEmbedder::new(384);
        let a = e.embed("Labs start Tuesday").unwrap().embedding;
        let b = e.embed("Labs start Tuesday").unwrap().embedding;
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        assert!((a.dot(&a).sqrt() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_terms_score_higher() {
        let e = HashingEmbedder::new(384);
        let q = e.embed("when do labs start").unwrap().embedding;
        let a = e
            .embed("Classes start Monday. Labs start Tuesday.")
            .unwrap()
            .embedding;
        let b = e.embed("The library is open 24/7.").unwrap().embedding;
        assert!(cosine(&q, &a) > 0.5);
        assert!(cosine(&q, &a) > cosine(&q, &b));
    }

    #[test]
    fn test_stopword_only_text_is_zero() {
        let e = HashingEmbedder::new(16);
        let v = e.embed("what is the").unwrap().embedding;
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_cache_marks_hits() {
        let e = HashingEmbedder::new(32).with_cache(QueryCache::new(10, Duration::from_secs(60)));
        assert!(!e.embed("library hours").unwrap().cached);
        assert!(e.embed("library hours").unwrap().cached);
        assert_eq!(e.model_version(), "hash-embedder-v1/32");
    }
}
