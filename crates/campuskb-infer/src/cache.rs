//! LRU cache with a time-to-live.
//!
//! Used for query embeddings and for whole retrieval results. Expired
//! entries are dropped on read; the least recently used entry is evicted
//! when full.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use ndarray::Array1;
use parking_lot::Mutex;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    order: VecDeque<String>,
    max_size: usize,
    ttl: Duration,
}

impl<V> CacheInner<V> {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn forget(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }
}

/// Thread-safe LRU cache with TTL expiry.
pub struct TtlCache<V> {
    inner: Mutex<CacheInner<V>>,
}

/// Cache of query embeddings.
pub type QueryCache = TtlCache<Array1<f32>>;

impl<V: Clone> TtlCache<V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(max_size),
                order: VecDeque::with_capacity(max_size),
                max_size: max_size.max(1),
                ttl,
            }),
        }
    }

    /// Returns None on miss or on an expired entry.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let ttl = inner.ttl;
        let (value, expired) = match inner.entries.get(key) {
            Some(entry) => (entry.value.clone(), entry.inserted_at.elapsed() >= ttl),
            None => return None,
        };
        if expired {
            inner.forget(key);
            return None;
        }
        inner.touch(key);
        Some(value)
    }

    pub fn put(&self, key: String, value: V) {
        let mut inner = self.inner.lock();
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };

        if inner.entries.contains_key(&key) {
            inner.touch(&key);
            inner.entries.insert(key, entry);
            return;
        }

        while inner.entries.len() >= inner.max_size {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}
