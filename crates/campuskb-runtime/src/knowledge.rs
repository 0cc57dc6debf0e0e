//! Knowledge base: the corpus store and the embedding index kept in step.
//!
//! Every mutation writes SQLite first (one transaction per document), then
//! swaps the document's chunks in the index under a single write lock.
//! Mutations are serialized with each other; queries are never blocked by
//! more than one document swap.

use std::sync::Arc;

use ndarray::Array1;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use campuskb_core::{ChunkingConfig, Error, Result};
use campuskb_infer::EmbedderBackend;
use campuskb_ingest::{DocumentInput, IngestFailure, Ingester, PreparedDocument};
use campuskb_store::{
    Chunk, ChunkRecord, CorpusStore, Document, DocumentSummary, EmbeddingIndex, IndexEntry,
    StoreStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Created,
    Replaced,
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestedDocument {
    pub id: String,
    pub logical_key: String,
    pub title: String,
    pub chunks: usize,
    pub status: IngestStatus,
}

/// Outcome of one ingestion batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub ingested: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub failed: Vec<IngestFailure>,
    pub documents: Vec<IngestedDocument>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub documents: usize,
    pub chunks: usize,
    pub reembedded: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RebuildSummary {
    pub documents: usize,
    pub chunks: usize,
    pub failed: Vec<IngestFailure>,
}

pub struct KnowledgeBase {
    store: Arc<CorpusStore>,
    index: Arc<EmbeddingIndex>,
    embedder: Arc<dyn EmbedderBackend>,
    ingester: Ingester,
    writes: Mutex<()>,
    /// Corpus totals as of the last mutation.
    cached_stats: RwLock<Option<StoreStats>>,
}

impl KnowledgeBase {
    pub fn new(
        store: Arc<CorpusStore>,
        index: Arc<EmbeddingIndex>,
        embedder: Arc<dyn EmbedderBackend>,
        chunking: ChunkingConfig,
    ) -> Result<Self> {
        if embedder.dimension() != index.dimension() {
            return Err(Error::InvalidConfig(format!(
                "embedder dimension {} does not match index dimension {}",
                embedder.dimension(),
                index.dimension()
            )));
        }
        let kb = Self {
            store,
            index,
            embedder,
            ingester: Ingester::new(chunking),
            writes: Mutex::new(()),
            cached_stats: RwLock::new(None),
        };
        kb.refresh_stats();
        Ok(kb)
    }

    pub fn index(&self) -> &Arc<EmbeddingIndex> {
        &self.index
    }

    pub fn store(&self) -> &Arc<CorpusStore> {
        &self.store
    }

    /// Ingest a batch. Each document succeeds or fails on its own.
    pub fn ingest(&self, inputs: &[DocumentInput]) -> IngestSummary {
        let batch = self.ingester.ingest_batch(inputs);
        let mut summary = IngestSummary {
            failed: batch.failures,
            ..Default::default()
        };

        for prepared in batch.prepared {
            let label = prepared.document.metadata.title.clone();
            match self.commit(prepared) {
                Ok(doc) => {
                    match doc.status {
                        IngestStatus::Created => summary.ingested += 1,
                        IngestStatus::Replaced => {
                            summary.ingested += 1;
                            summary.replaced += 1;
                        }
                        IngestStatus::Unchanged => summary.skipped += 1,
                    }
                    summary.documents.push(doc);
                }
                Err(e) => {
                    warn!("Failed to store document {}: {}", label, e);
                    summary.failed.push(IngestFailure::new(label, &e));
                }
            }
        }

        self.refresh_stats();
        info!(
            "Ingestion batch: {} ingested ({} replaced), {} unchanged, {} failed",
            summary.ingested,
            summary.replaced,
            summary.skipped,
            summary.failed.len()
        );
        summary
    }

    fn commit(&self, prepared: PreparedDocument) -> Result<IngestedDocument> {
        let PreparedDocument { document, chunks } = prepared;
        let _writes = self.writes.lock();

        let existing = self.store.find_by_key(&document.logical_key)?;
        let status = match &existing {
            Some(old) if old.content_hash == document.content_hash => {
                return Ok(IngestedDocument {
                    id: old.id.clone(),
                    logical_key: old.logical_key.clone(),
                    title: old.metadata.title.clone(),
                    chunks: self.store.chunks_for_document(&old.id)?.len(),
                    status: IngestStatus::Unchanged,
                });
            }
            Some(_) => IngestStatus::Replaced,
            None => IngestStatus::Created,
        };

        let chunk_count = chunks.len();
        let superseded = self.persist(&document, chunks)?;
        if let Some(old) = &superseded {
            info!("Document {} supersedes {} (key {})", document.id, old, document.logical_key);
        }

        Ok(IngestedDocument {
            id: document.id,
            logical_key: document.logical_key,
            title: document.metadata.title,
            chunks: chunk_count,
            status,
        })
    }

    /// Embed, store and index one document. Returns the superseded id, if any.
    fn persist(&self, document: &Document, chunks: Vec<Chunk>) -> Result<Option<String>> {
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = self.embed_all(&texts)?;
        let superseded = self.store.replace_document(
            document,
            &chunks,
            &vectors,
            &self.embedder.model_version(),
        )?;

        let entries = entries_for(document, chunks, vectors);
        match superseded.as_deref() {
            Some(old) if old != document.id => self.index.supersede(old, &document.id, entries)?,
            _ => self.index.replace_document(&document.id, entries)?,
        };
        Ok(superseded)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let _writes = self.writes.lock();
        let deleted = self.store.delete_document(id)?;
        let removed = self.index.remove_document(id);
        if deleted {
            info!("Deleted document {} ({} chunks unindexed)", id, removed);
            self.refresh_stats();
        }
        Ok(deleted)
    }

    pub fn document(&self, id: &str) -> Result<Option<(Document, Vec<Chunk>)>> {
        let Some(document) = self.store.get_document(id)? else {
            return Ok(None);
        };
        let chunks = self.store.chunks_for_document(id)?;
        Ok(Some((document, chunks)))
    }

    pub fn list(&self) -> Result<Vec<DocumentSummary>> {
        self.store.list_documents()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// Totals cached at the last mutation; `None` if they could not be read.
    pub fn corpus_stats(&self) -> Option<StoreStats> {
        self.cached_stats.read().clone()
    }

    fn refresh_stats(&self) {
        let stats = match self.store.stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Could not read corpus totals: {}", e);
                None
            }
        };
        *self.cached_stats.write() = stats;
    }

    /// Fill the index from storage, re-embedding chunks whose stored
    /// embedding came from another model version or dimension.
    pub fn load(&self) -> Result<LoadSummary> {
        let _writes = self.writes.lock();
        let version = self.embedder.model_version();
        let stored = self.store.load_all()?;

        let mut summary = LoadSummary::default();
        let mut current: Option<String> = None;
        let mut entries: Vec<IndexEntry> = Vec::new();

        self.index.clear();
        for item in stored {
            let doc_id = item.record.chunk.document_id.clone();
            if current.as_deref() != Some(doc_id.as_str()) {
                if let Some(done) = current.take() {
                    self.index.replace_document(&done, std::mem::take(&mut entries))?;
                    summary.documents += 1;
                }
                current = Some(doc_id);
            }

            let vector = match item.embedding {
                Some(e) if e.model_version == version && e.vector.len() == self.index.dimension() => {
                    e.vector
                }
                _ => {
                    let vector = self.embed_one(&item.record.chunk.text)?;
                    self.store
                        .update_embedding(&item.record.chunk.id, &vector, &version)?;
                    summary.reembedded += 1;
                    vector
                }
            };
            summary.chunks += 1;
            entries.push(IndexEntry {
                record: Arc::new(item.record),
                vector,
            });
        }
        if let Some(done) = current {
            self.index.replace_document(&done, entries)?;
            summary.documents += 1;
        }
        self.refresh_stats();

        info!(
            "Index loaded: {} documents, {} chunks ({} re-embedded with {})",
            summary.documents, summary.chunks, summary.reembedded, version
        );
        Ok(summary)
    }

    /// Re-chunk and re-embed every stored document with the current settings.
    pub fn rebuild(&self) -> Result<RebuildSummary> {
        let _writes = self.writes.lock();
        let mut summary = RebuildSummary::default();

        for listed in self.store.list_documents()? {
            let Some(document) = self.store.get_document(&listed.id)? else {
                continue;
            };
            let chunks = self.ingester.rechunk(&document);
            let count = chunks.len();
            match self.persist(&document, chunks) {
                Ok(_) => {
                    summary.documents += 1;
                    summary.chunks += count;
                }
                Err(e) => {
                    warn!("Rebuild failed for {}: {}", document.id, e);
                    summary.failed.push(IngestFailure::new(document.metadata.title.clone(), &e));
                }
            }
        }

        self.refresh_stats();
        info!(
            "Index rebuilt: {} documents, {} chunks, {} failed",
            summary.documents,
            summary.chunks,
            summary.failed.len()
        );
        Ok(summary)
    }

    fn embed_all(&self, texts: &[&str]) -> Result<Vec<Array1<f32>>> {
        let results = self.embedder.embed_batch(texts).map_err(unavailable)?;
        Ok(results.into_iter().map(|r| r.embedding).collect())
    }

    fn embed_one(&self, text: &str) -> Result<Array1<f32>> {
        self.embedder
            .embed(text)
            .map(|r| r.embedding)
            .map_err(unavailable)
    }
}

fn unavailable(e: Error) -> Error {
    match e {
        Error::IndexUnavailable(_) => e,
        other => Error::IndexUnavailable(format!("embedding failed: {}", other)),
    }
}

fn entries_for(document: &Document, chunks: Vec<Chunk>, vectors: Vec<Array1<f32>>) -> Vec<IndexEntry> {
    chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| IndexEntry {
            record: Arc::new(ChunkRecord {
                chunk,
                title: document.metadata.title.clone(),
                source: document.metadata.source.clone(),
            }),
            vector,
        })
        .collect()
}
