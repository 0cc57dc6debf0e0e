//! Retriever: embed, over-fetch, filter, re-rank, truncate.
//!
//! 1. Embed the query, blended with a short summary of recent user turns so
//!    follow-ups like "and when does it close?" still find their subject.
//! 2. Fetch `k * oversample` nearest chunks.
//! 3. Score each as `(1 - w) * similarity + w * lexical_overlap`; drop those
//!    under `min_relevance`.
//! 4. Select greedily by score, at most `max_chunks_per_document` per
//!    document. Equal scores prefer the chunk closest (by ordinal) to chunks
//!    already selected from the same document, then the smaller chunk id.
//! 5. Stop at `k`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ndarray::Array1;
use tracing::{debug, warn};

use campuskb_core::text::{term_overlap, term_set, truncate_chars};
use campuskb_core::{DistanceMetric, Error, Message, Result, RetrievalConfig, Role};
use campuskb_infer::{EmbedderBackend, TtlCache};
use campuskb_store::EmbeddingIndex;

use crate::types::{RetrievalResult, RetrievedChunk};

/// Weight of the conversation summary in the blended query vector.
const CONTEXT_WEIGHT: f32 = 0.3;
const SUMMARY_MAX_CHARS: usize = 300;

pub struct Retriever {
    index: Arc<EmbeddingIndex>,
    embedder: Arc<dyn EmbedderBackend>,
    config: RetrievalConfig,
    cache: TtlCache<Arc<Vec<RetrievedChunk>>>,
}

impl Retriever {
    pub fn new(
        index: Arc<EmbeddingIndex>,
        embedder: Arc<dyn EmbedderBackend>,
        config: RetrievalConfig,
    ) -> Self {
        let cache = TtlCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            index,
            embedder,
            config,
            cache,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve up to `k` chunks for `query`, using `context` (prior turns,
    /// oldest first) for query expansion.
    ///
    /// Fails only with `Error::IndexUnavailable`. An empty result is not an
    /// error: it means nothing cleared the relevance threshold.
    pub fn retrieve(&self, query: &str, context: &[Message], k: usize) -> Result<RetrievalResult> {
        let query = query.trim();
        if k == 0 || query.is_empty() || self.index.is_empty() {
            return Ok(RetrievalResult::empty());
        }

        let summary = self.conversation_summary(context);
        let cache_key = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.index.generation(),
            k,
            query,
            summary
        );
        if let Some(hit) = self.cache.get(&cache_key) {
            debug!("Retrieval cache hit for '{}'", query);
            return Ok(RetrievalResult {
                chunks: hit.as_ref().clone(),
                cached: true,
            });
        }

        let vector = self.query_vector(query, &summary)?;
        let fetch = k.saturating_mul(self.config.oversample.max(2));
        let neighbors = self
            .index
            .query(&vector, fetch)
            .map_err(|e| Error::IndexUnavailable(e.to_string()))?;

        let mut query_terms = term_set(query);
        if query_terms.is_empty() {
            query_terms = term_set(&summary);
        }

        let w = self.config.lexical_weight;
        let candidates: Vec<RetrievedChunk> = neighbors
            .into_iter()
            .filter_map(|n| {
                // A concurrent replacement may have removed the chunk since the query.
                let record = self.index.get(&n.chunk_id)?;
                let similarity = self.similarity(n.distance);
                let lexical = lexical_score(&query_terms, &record.title, &record.chunk.text);
                Some(RetrievedChunk {
                    record,
                    score: (1.0 - w) * similarity + w * lexical,
                    similarity,
                    lexical,
                })
            })
            .filter(|c| c.score >= self.config.min_relevance)
            .collect();

        let chunks = select(candidates, k, self.config.max_chunks_per_document);
        debug!(
            "Retrieved {} chunks for '{}' (fetched {}, generation {})",
            chunks.len(),
            query,
            fetch,
            self.index.generation()
        );

        self.cache.put(cache_key, Arc::new(chunks.clone()));
        Ok(RetrievalResult {
            chunks,
            cached: false,
        })
    }

    /// The last few user turns, newest last, capped in length.
    pub fn conversation_summary(&self, context: &[Message]) -> String {
        let turns: Vec<&str> = context
            .iter()
            .rev()
            .filter(|m| m.role == Role::User)
            .take(self.config.expansion_turns)
            .map(|m| m.content.trim())
            .collect();
        let joined = turns.into_iter().rev().collect::<Vec<_>>().join(" ");
        truncate_chars(&joined, SUMMARY_MAX_CHARS).to_string()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn query_vector(&self, query: &str, summary: &str) -> Result<Array1<f32>> {
        let mut vector = self.embed(query)?;
        if !summary.is_empty() {
            let context = self.embed(summary)?;
            vector.scaled_add(CONTEXT_WEIGHT, &context);
        }
        Ok(vector)
    }

    fn embed(&self, text: &str) -> Result<Array1<f32>> {
        match self.embedder.embed(text) {
            Ok(result) => Ok(result.embedding),
            Err(Error::IndexUnavailable(msg)) => Err(Error::IndexUnavailable(msg)),
            Err(e) => {
                warn!("Embedding failed: {}", e);
                Err(Error::IndexUnavailable(format!("embedding failed: {}", e)))
            }
        }
    }

    fn similarity(&self, distance: f32) -> f32 {
        match self.index.metric() {
            DistanceMetric::Cosine => (1.0 - distance).clamp(0.0, 1.0),
            DistanceMetric::Euclidean => 1.0 / (1.0 + distance.max(0.0)),
        }
    }
}

fn lexical_score(query_terms: &BTreeSet<String>, title: &str, text: &str) -> f32 {
    let mut terms = term_set(text);
    terms.extend(term_set(title));
    term_overlap(query_terms, &terms)
}

/// Greedy selection under the per-document cap.
fn select(mut pool: Vec<RetrievedChunk>, k: usize, per_document: usize) -> Vec<RetrievedChunk> {
    let mut selected: Vec<RetrievedChunk> = Vec::with_capacity(k);
    let mut taken: HashMap<String, Vec<u32>> = HashMap::new();

    while selected.len() < k {
        let contiguity = |c: &RetrievedChunk| -> u32 {
            taken
                .get(c.document_id())
                .and_then(|ords| ords.iter().map(|&o| o.abs_diff(c.record.chunk.ordinal)).min())
                .unwrap_or(u32::MAX)
        };

        let best = pool
            .iter()
            .enumerate()
            .filter(|(_, c)| taken.get(c.document_id()).map_or(0, Vec::len) < per_document)
            .min_by(|(_, a), (_, b)| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| contiguity(a).cmp(&contiguity(b)))
                    .then_with(|| a.chunk_id().cmp(b.chunk_id()))
            })
            .map(|(i, _)| i);

        let Some(i) = best else { break };
        let chosen = pool.swap_remove(i);
        taken
            .entry(chosen.document_id().to_string())
            .or_default()
            .push(chosen.record.chunk.ordinal);
        selected.push(chosen);
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use campuskb_infer::{EmbeddingResult, HashingEmbedder};
    use campuskb_store::{chunk_id, Chunk, ChunkRecord, IndexEntry};
    use std::collections::HashSet;
    use std::time::Duration;

    fn config() -> RetrievalConfig {
        RetrievalConfig {
            top_k: 5,
            oversample: 4,
            max_chunks_per_document: 2,
            lexical_weight: 0.35,
            min_relevance: 0.15,
            expansion_turns: 2,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 16,
        }
    }

    fn setup(docs: &[(&str, &[&str])]) -> Retriever {
        setup_with(docs, config())
    }

    fn setup_with(docs: &[(&str, &[&str])], config: RetrievalConfig) -> Retriever {
        let embedder: Arc<dyn EmbedderBackend> = Arc::new(HashingEmbedder::new(384));
        let index = Arc::new(EmbeddingIndex::new(384, DistanceMetric::Cosine));
        for (doc, texts) in docs {
            for (i, text) in texts.iter().enumerate() {
                let record = ChunkRecord {
                    chunk: Chunk {
                        id: chunk_id(doc, i as u32),
                        document_id: doc.to_string(),
                        ordinal: i as u32,
                        text: text.to_string(),
                        start: 0,
                        end: text.len(),
                        token_estimate: 1,
                    },
                    title: doc.to_string(),
                    source: None,
                };
                let vector = embedder.embed(text).unwrap().embedding;
                index
                    .upsert(IndexEntry {
                        record: Arc::new(record),
                        vector,
                    })
                    .unwrap();
            }
        }
        Retriever::new(index, embedder, config)
    }

    fn chunk(doc: &str, ordinal: u32, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            record: Arc::new(ChunkRecord {
                chunk: Chunk {
                    id: chunk_id(doc, ordinal),
                    document_id: doc.to_string(),
                    ordinal,
                    text: String::new(),
                    start: 0,
                    end: 0,
                    token_estimate: 0,
                },
                title: doc.to_string(),
                source: None,
            }),
            score,
            similarity: score,
            lexical: 0.0,
        }
    }

    #[test]
    fn test_labs_query_prefers_calendar() {
        let retriever = setup(&[
            ("a", &["Classes start Monday. Labs start Tuesday."]),
            ("b", &["The library is open 24/7."]),
        ]);
        let result = retriever.retrieve("when do labs start", &[], 5).unwrap();
        assert!(result.is_grounded());
        assert_eq!(result.chunks[0].document_id(), "a");
        if let Some(pos) = result.chunks.iter().position(|c| c.document_id() == "b") {
            assert!(pos > 0);
        }
    }

    #[test]
    fn test_no_grounding_below_threshold() {
        // Without shared terms the combined score cannot exceed 1 - lexical_weight.
        let strict = RetrievalConfig {
            min_relevance: 0.9,
            ..config()
        };
        let retriever = setup_with(&[("b", &["The library is open 24/7."])], strict);
        let result = retriever.retrieve("parking permit fees", &[], 5).unwrap();
        assert!(!result.is_grounded());
    }

    #[test]
    fn test_empty_index_is_empty_result() {
        let retriever = setup(&[]);
        assert!(retriever.retrieve("anything", &[], 5).unwrap().is_empty());
    }

    #[test]
    fn test_per_document_cap_and_unique_ids() {
        let texts: &[&str] = &[
            "Tuition fees are due in September.",
            "Tuition fees can be paid in instalments.",
            "Late tuition fees incur a penalty.",
            "Tuition fees for international students differ.",
        ];
        let retriever = setup(&[
            ("fees", texts),
            ("aid", &["Financial aid can cover tuition fees."]),
        ]);
        let result = retriever.retrieve("tuition fees", &[], 5).unwrap();

        let mut per_doc: HashMap<&str, usize> = HashMap::new();
        let mut ids = HashSet::new();
        for c in result.iter() {
            *per_doc.entry(c.document_id()).or_default() += 1;
            assert!(ids.insert(c.chunk_id().to_string()));
        }
        assert!(per_doc.values().all(|&n| n <= 2));
        assert!(result.len() <= 5);
        assert!(result
            .chunks
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_tie_break_contiguity_then_id() {
        let pool = vec![
            chunk("d", 7, 0.5),
            chunk("d", 0, 0.9),
            chunk("d", 1, 0.5),
            chunk("e", 0, 0.5),
        ];
        let picked = select(pool, 3, 2);
        let ids: Vec<&str> = picked.iter().map(|c| c.chunk_id()).collect();
        // d#0001 sits next to d#0000, then d is capped and e#0000 is all that is left.
        assert_eq!(ids, vec!["d#0000", "d#0001", "e#0000"]);
    }

    #[test]
    fn test_conversation_expansion() {
        let retriever = setup(&[
            ("gym", &["The gym opens at six and closes at ten."]),
            ("library", &["The library is open 24/7."]),
        ]);
        let history = vec![
            Message::user("Tell me about the gym"),
            Message::assistant("The gym is in building C."),
        ];
        assert_eq!(retriever.conversation_summary(&history), "Tell me about the gym");
        let result = retriever.retrieve("when does it close?", &history, 3).unwrap();
        assert_eq!(result.chunks[0].document_id(), "gym");
    }

    #[test]
    fn test_cache_invalidated_by_index_change() {
        let retriever = setup(&[("a", &["Classes start Monday. Labs start Tuesday."])]);
        let first = retriever.retrieve("labs start", &[], 3).unwrap();
        assert!(!first.cached);
        assert!(retriever.retrieve("labs start", &[], 3).unwrap().cached);

        retriever.index.remove_document("a");
        let after = retriever.retrieve("labs start", &[], 3).unwrap();
        assert!(!after.cached);
        assert!(after.is_empty());
    }

    struct BrokenEmbedder;

    impl EmbedderBackend for BrokenEmbedder {
        fn embed(&self, _text: &str) -> Result<EmbeddingResult> {
            Err(Error::Storage("model file missing".into()))
        }
        fn dimension(&self) -> usize {
            4
        }
        fn model_version(&self) -> String {
            "broken".into()
        }
    }

    #[test]
    fn test_embedder_failure_is_index_unavailable() {
        let index = Arc::new(EmbeddingIndex::new(4, DistanceMetric::Cosine));
        index
            .upsert(IndexEntry {
                record: chunk("a", 0, 0.0).record,
                vector: ndarray::array![1.0, 0.0, 0.0, 0.0],
            })
            .unwrap();
        let retriever = Retriever::new(index, Arc::new(BrokenEmbedder), config());
        assert!(matches!(
            retriever.retrieve("anything", &[], 3),
            Err(Error::IndexUnavailable(_))
        ));
    }
}
