//! Retrieval result types.

use std::sync::Arc;

use serde::Serialize;

use campuskb_store::ChunkRecord;

/// One retrieved chunk with its scores.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub record: Arc<ChunkRecord>,
    /// Combined score used for ranking.
    pub score: f32,
    /// Vector similarity in 0.0..=1.0.
    pub similarity: f32,
    /// Fraction of query terms found in the chunk.
    pub lexical: f32,
}

impl RetrievedChunk {
    pub fn chunk_id(&self) -> &str {
        &self.record.chunk.id
    }

    pub fn document_id(&self) -> &str {
        &self.record.chunk.document_id
    }
}

/// Ranked chunks, best first.
///
/// Scores never increase along the sequence, chunk ids are unique, and no
/// document contributes more than the configured cap. An empty result means
/// no grounding is available.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub chunks: Vec<RetrievedChunk>,
    /// Served from the retrieval cache.
    pub cached: bool,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_grounded(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetrievedChunk> {
        self.chunks.iter()
    }

    /// Distinct document sources in rank order, at most `limit`.
    pub fn sources(&self, limit: usize) -> Vec<SourceRef> {
        let mut seen: Vec<&str> = Vec::new();
        let mut sources = Vec::new();
        for hit in &self.chunks {
            if sources.len() == limit {
                break;
            }
            if seen.contains(&hit.document_id()) {
                continue;
            }
            seen.push(hit.document_id());
            sources.push(SourceRef {
                title: hit.record.title.clone(),
                source: hit.record.source.clone(),
                score: hit.score,
            });
        }
        sources
    }
}

/// Citation returned alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub score: f32,
}
