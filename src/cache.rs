//! TTL-bounded query result cache.
//!
//! Sits in front of the local backend's search path so repeated queries skip
//! both the query embedding and the similarity scan. Keys hash
//! `(query, k)`; values carry the ranked hits plus their insertion instant.
//!
//! Eviction is two-stage: every access first purges entries older than the
//! TTL, then, if still over capacity, the oldest-by-timestamp entries drop
//! until the cache fits. A lookup re-checks the entry's own age before
//! returning it — a hit is never served on the strength of an earlier purge.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::models::SearchHit;

/// Time source seam so TTL behavior is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CachedQuery {
    hits: Vec<SearchHit>,
    inserted_at: Instant,
}

pub struct QueryCache {
    entries: HashMap<u64, CachedQuery>,
    ttl: Duration,
    max_entries: usize,
    clock: Box<dyn Clock>,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self::with_clock(ttl, max_entries, Box::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, max_entries: usize, clock: Box<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
            clock,
        }
    }

    fn key(query: &str, k: i64) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hasher.update(k.to_le_bytes());
        let digest = hasher.finalize();
        u64::from_le_bytes(digest[0..8].try_into().unwrap())
    }

    pub fn get(&mut self, query: &str, k: i64) -> Option<Vec<SearchHit>> {
        let now = self.clock.now();
        self.purge_expired(now);

        let entry = self.entries.get(&Self::key(query, k))?;
        // The purge above already dropped expired entries, but age is
        // re-checked here so a hit can never outlive the TTL.
        if now.duration_since(entry.inserted_at) > self.ttl {
            return None;
        }
        Some(entry.hits.clone())
    }

    pub fn insert(&mut self, query: &str, k: i64, hits: Vec<SearchHit>) {
        if self.max_entries == 0 {
            return;
        }
        let now = self.clock.now();
        self.purge_expired(now);

        self.entries.insert(
            Self::key(query, k),
            CachedQuery {
                hits,
                inserted_at: now,
            },
        );

        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(key, _)| *key);
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.duration_since(e.inserted_at) <= ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Manually advanced clock for TTL tests.
    #[derive(Clone)]
    struct TestClock {
        start: Instant,
        offset: Arc<Mutex<Duration>>,
    }

    impl TestClock {
        fn new() -> Self {
            Self {
                start: Instant::now(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.start + *self.offset.lock().unwrap()
        }
    }

    fn hit(document_id: i64, chunk_index: i64) -> SearchHit {
        SearchHit {
            content: format!("chunk {}:{}", document_id, chunk_index),
            document_id,
            chunk_index,
            similarity: 0.9,
        }
    }

    #[test]
    fn hit_within_ttl_is_served() {
        let clock = TestClock::new();
        let mut cache =
            QueryCache::with_clock(Duration::from_secs(60), 10, Box::new(clock.clone()));
        cache.insert("query", 5, vec![hit(1, 0)]);
        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get("query", 5).unwrap().len(), 1);
    }

    #[test]
    fn expired_entry_is_never_served() {
        let clock = TestClock::new();
        let mut cache =
            QueryCache::with_clock(Duration::from_secs(60), 10, Box::new(clock.clone()));
        cache.insert("query", 5, vec![hit(1, 0)]);
        clock.advance(Duration::from_secs(61));
        assert!(cache.get("query", 5).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn key_includes_k() {
        let mut cache = QueryCache::new(Duration::from_secs(60), 10);
        cache.insert("query", 5, vec![hit(1, 0)]);
        assert!(cache.get("query", 10).is_none());
        assert!(cache.get("query", 5).is_some());
    }

    #[test]
    fn size_bound_never_exceeded() {
        let clock = TestClock::new();
        let mut cache =
            QueryCache::with_clock(Duration::from_secs(600), 4, Box::new(clock.clone()));
        for i in 0..20 {
            // Distinct timestamps so "oldest" is well-defined.
            clock.advance(Duration::from_millis(10));
            cache.insert(&format!("query {}", i), 5, vec![hit(i, 0)]);
            assert!(cache.len() <= 4);
        }
        // Newest entries survive.
        assert!(cache.get("query 19", 5).is_some());
        assert!(cache.get("query 0", 5).is_none());
    }

    #[test]
    fn ttl_purge_runs_before_size_eviction() {
        let clock = TestClock::new();
        let mut cache = QueryCache::with_clock(Duration::from_secs(30), 2, Box::new(clock.clone()));
        cache.insert("old", 5, vec![hit(1, 0)]);
        clock.advance(Duration::from_secs(31));
        // Both slots free again: the stale entry purges instead of counting
        // toward capacity.
        cache.insert("a", 5, vec![hit(2, 0)]);
        cache.insert("b", 5, vec![hit(3, 0)]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", 5).is_some());
        assert!(cache.get("b", 5).is_some());
    }
}
