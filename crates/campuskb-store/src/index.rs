//! Exact nearest-neighbour index over chunk embeddings.
//!
//! Many readers, one writer: queries take a shared lock, upserts and document
//! replacement take the write lock for the whole mutation so no reader ever
//! sees a half-replaced document. Every mutation bumps `generation`, which
//! downstream caches use to invalidate themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::Array1;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use campuskb_core::{DistanceMetric, Error, Result};

use crate::types::ChunkRecord;

/// A chunk and its vector, ready for insertion.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub record: Arc<ChunkRecord>,
    pub vector: Array1<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub chunk_id: String,
    pub distance: f32,
}

struct Slot {
    /// Insertion sequence number; breaks distance ties.
    seq: u64,
    record: Arc<ChunkRecord>,
    vector: Array1<f32>,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    positions: HashMap<String, usize>,
    next_seq: u64,
}

impl Inner {
    fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(pos) = self.positions.remove(chunk_id) else {
            return false;
        };
        self.slots.swap_remove(pos);
        if let Some(moved) = self.slots.get(pos) {
            self.positions.insert(moved.record.chunk.id.clone(), pos);
        }
        true
    }

    fn upsert(&mut self, record: Arc<ChunkRecord>, vector: Array1<f32>) {
        if let Some(&pos) = self.positions.get(&record.chunk.id) {
            // Same id: replace in place and keep the original insertion order.
            let slot = &mut self.slots[pos];
            slot.record = record;
            slot.vector = vector;
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.positions.insert(record.chunk.id.clone(), self.slots.len());
        self.slots.push(Slot {
            seq,
            record,
            vector,
        });
    }
}

pub struct EmbeddingIndex {
    dimension: usize,
    metric: DistanceMetric,
    inner: RwLock<Inner>,
    generation: AtomicU64,
}

impl EmbeddingIndex {
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            inner: RwLock::new(Inner::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Incremented by every mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a chunk's vector. Idempotent on chunk id.
    pub fn upsert(&self, entry: IndexEntry) -> Result<()> {
        let vector = self.prepare(entry.vector)?;
        self.inner.write().upsert(entry.record, vector);
        self.bump();
        Ok(())
    }

    /// Swap all chunks of `document_id` for `entries` in one step.
    ///
    /// Vectors are validated before the write lock is taken; on error the
    /// index is left untouched.
    pub fn replace_document(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize> {
        self.swap(None, document_id, entries)
    }

    /// Like `replace_document`, also dropping the chunks of a superseded
    /// document in the same write.
    pub fn supersede(
        &self,
        superseded: &str,
        document_id: &str,
        entries: Vec<IndexEntry>,
    ) -> Result<usize> {
        self.swap(Some(superseded), document_id, entries)
    }

    fn swap(
        &self,
        superseded: Option<&str>,
        document_id: &str,
        entries: Vec<IndexEntry>,
    ) -> Result<usize> {
        let prepared = entries
            .into_iter()
            .map(|e| Ok((e.record, self.prepare(e.vector)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut inner = self.inner.write();
        let mut removed = Self::remove_document_locked(&mut inner, document_id);
        if let Some(old) = superseded {
            removed += Self::remove_document_locked(&mut inner, old);
        }
        for (record, vector) in prepared {
            inner.upsert(record, vector);
        }
        drop(inner);
        self.bump();
        debug!("Index replaced document {} ({} old chunks)", document_id, removed);
        Ok(removed)
    }

    /// Remove every chunk of a document. Returns how many were removed.
    pub fn remove_document(&self, document_id: &str) -> usize {
        let removed = Self::remove_document_locked(&mut self.inner.write(), document_id);
        if removed > 0 {
            self.bump();
        }
        removed
    }

    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
        self.bump();
    }

    pub fn get(&self, chunk_id: &str) -> Option<Arc<ChunkRecord>> {
        let inner = self.inner.read();
        inner
            .positions
            .get(chunk_id)
            .map(|&pos| inner.slots[pos].record.clone())
    }

    /// Records of one document, in ordinal order.
    pub fn document_chunks(&self, document_id: &str) -> Vec<Arc<ChunkRecord>> {
        let inner = self.inner.read();
        let mut records: Vec<_> = inner
            .slots
            .iter()
            .filter(|s| s.record.chunk.document_id == document_id)
            .map(|s| s.record.clone())
            .collect();
        records.sort_by_key(|r| r.chunk.ordinal);
        records
    }

    /// The `k` nearest chunks, best first. Equal distances keep insertion order.
    /// An empty index yields an empty result.
    pub fn query(&self, vector: &Array1<f32>, k: usize) -> Result<Vec<Neighbor>> {
        let query = self.prepare(vector.clone())?;
        let inner = self.inner.read();
        if k == 0 || inner.slots.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, u64, usize)> = inner
            .slots
            .iter()
            .enumerate()
            .map(|(pos, slot)| (self.distance(&query, &slot.vector), slot.seq, pos))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, _, pos)| Neighbor {
                chunk_id: inner.slots[pos].record.chunk.id.clone(),
                distance,
            })
            .collect())
    }

    fn remove_document_locked(inner: &mut Inner, document_id: &str) -> usize {
        let ids: Vec<String> = inner
            .slots
            .iter()
            .filter(|s| s.record.chunk.document_id == document_id)
            .map(|s| s.record.chunk.id.clone())
            .collect();
        for id in &ids {
            inner.remove(id);
        }
        ids.len()
    }

    /// Check the dimension and, for cosine, normalize to unit length.
    fn prepare(&self, vector: Array1<f32>) -> Result<Array1<f32>> {
        if vector.len() != self.dimension {
            return Err(Error::InvalidConfig(format!(
                "embedding dimension {} does not match index dimension {}",
                vector.len(),
                self.dimension
            )));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidRequest("embedding contains non-finite values".into()));
        }
        match self.metric {
            DistanceMetric::Cosine => {
                let norm = vector.dot(&vector).sqrt();
                if norm < 1e-9 {
                    Ok(vector)
                } else {
                    Ok(vector / norm)
                }
            }
            DistanceMetric::Euclidean => Ok(vector),
        }
    }

    fn distance(&self, a: &Array1<f32>, b: &Array1<f32>) -> f32 {
        match self.metric {
            // Both sides are unit length (or zero, which scores as orthogonal).
            DistanceMetric::Cosine => (1.0 - a.dot(b)).clamp(0.0, 2.0),
            DistanceMetric::Euclidean => {
                let diff = a - b;
                diff.dot(&diff).sqrt()
            }
        }
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}
