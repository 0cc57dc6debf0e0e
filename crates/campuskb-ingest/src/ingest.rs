//! Document ingestion: normalize, identify, chunk.
//!
//! Ingestion here is pure. Persisting and embedding the prepared documents is
//! the knowledge base's job, so a failed embedding never leaves half a
//! document behind.

use serde::Serialize;
use tracing::{info, warn};

use campuskb_core::{ChunkingConfig, Error, Result};
use campuskb_store::{content_hash, document_id, Chunk, Document};

use crate::chunking::Chunker;
use crate::document::{logical_key, DocumentInput};
use crate::normalize::normalize;

/// A normalized document and the chunks cut from it.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub document: Document,
    pub chunks: Vec<Chunk>,
}

/// Why one document of a batch was rejected.
#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub document: String,
    pub reason: String,
}

impl IngestFailure {
    pub fn new(document: impl Into<String>, error: &Error) -> Self {
        let reason = match error {
            Error::DocumentFormat { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        Self {
            document: document.into(),
            reason,
        }
    }
}

#[derive(Debug, Default)]
pub struct PreparedBatch {
    pub prepared: Vec<PreparedDocument>,
    pub failures: Vec<IngestFailure>,
}

pub struct Ingester {
    chunker: Chunker,
}

impl Ingester {
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            chunker: Chunker::new(config),
        }
    }

    /// Normalize and chunk one document.
    pub fn ingest(&self, input: &DocumentInput) -> Result<PreparedDocument> {
        let label = input.label();
        let key = logical_key(input)?;
        let text = normalize(input.source_type, &label, &input.payload)?;
        let hash = content_hash(&input.payload);
        let id = document_id(&key, &hash);

        let chunks = self.chunker.chunk(&id, &text);
        if chunks.is_empty() {
            return Err(Error::document_format(label, "document produced no chunks"));
        }

        Ok(PreparedDocument {
            document: Document {
                id,
                logical_key: key,
                source_type: input.source_type,
                metadata: input.metadata(),
                content_hash: hash,
                text,
                created_at: chrono::Utc::now().timestamp_millis(),
            },
            chunks,
        })
    }

    /// Ingest a batch. A bad document is reported and skipped; the rest proceed.
    pub fn ingest_batch(&self, inputs: &[DocumentInput]) -> PreparedBatch {
        let mut batch = PreparedBatch::default();
        for input in inputs {
            match self.ingest(input) {
                Ok(prepared) => batch.prepared.push(prepared),
                Err(e) => {
                    warn!("Rejected document {}: {}", input.label(), e);
                    batch.failures.push(IngestFailure::new(input.label(), &e));
                }
            }
        }
        info!(
            "Prepared {} documents ({} rejected)",
            batch.prepared.len(),
            batch.failures.len()
        );
        batch
    }

    /// Re-cut a stored document with the current chunking parameters.
    pub fn rechunk(&self, document: &Document) -> Vec<Chunk> {
        self.chunker.chunk(&document.id, &document.text)
    }
}
