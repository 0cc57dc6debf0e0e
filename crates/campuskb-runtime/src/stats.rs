//! Pipeline counters. Lock-free so status reads never block the query path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineStats {
    queries: AtomicU64,
    grounded: AtomicU64,
    ungrounded: AtomicU64,
    degraded: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    capability: AtomicU64,
    cache_hits: AtomicU64,
    retrievals: AtomicU64,
    retrieval_micros: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub queries_served: u64,
    pub grounded_answers: u64,
    pub ungrounded_answers: u64,
    pub degraded_responses: u64,
    pub rejected_requests: u64,
    pub generation_retries: u64,
    /// Answers produced by a persona capability instead of retrieval.
    pub capability_answers: u64,
    pub retrieval_cache_hits: u64,
    pub avg_retrieval_ms: f64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_answer(&self, grounded: bool) {
        let counter = if grounded {
            &self.grounded
        } else {
            &self.ungrounded
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capability(&self) {
        self.capability.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retrieval(&self, elapsed: Duration, cached: bool) {
        self.retrievals.fetch_add(1, Ordering::Relaxed);
        self.retrieval_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let retrievals = self.retrievals.load(Ordering::Relaxed);
        let micros = self.retrieval_micros.load(Ordering::Relaxed);
        StatsSnapshot {
            queries_served: self.queries.load(Ordering::Relaxed),
            grounded_answers: self.grounded.load(Ordering::Relaxed),
            ungrounded_answers: self.ungrounded.load(Ordering::Relaxed),
            degraded_responses: self.degraded.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            generation_retries: self.retries.load(Ordering::Relaxed),
            capability_answers: self.capability.load(Ordering::Relaxed),
            retrieval_cache_hits: self.cache_hits.load(Ordering::Relaxed),
            avg_retrieval_ms: if retrievals == 0 {
                0.0
            } else {
                micros as f64 / retrievals as f64 / 1000.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_average() {
        let stats = PipelineStats::new();
        stats.record_query();
        stats.record_answer(true);
        stats.record_retrieval(Duration::from_millis(4), false);
        stats.record_retrieval(Duration::from_millis(2), true);

        let snap = stats.snapshot();
        assert_eq!(snap.queries_served, 1);
        assert_eq!(snap.grounded_answers, 1);
        assert_eq!(snap.retrieval_cache_hits, 1);
        assert!((snap.avg_retrieval_ms - 3.0).abs() < 1e-9);
    }
}
