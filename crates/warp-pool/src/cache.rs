//! Hot cache of fully reassembled tensors
//!
//! Entries are keyed by tensor and tagged with the tensor generation at the
//! time of the read; a lookup only hits when the generation still matches
//! and the entry is younger than the TTL.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::types::TensorId;

#[derive(Debug, Clone)]
struct CachedTensor {
    data: Bytes,
    generation: u64,
    inserted: Instant,
}

/// Byte-bounded LRU of reassembled tensors
pub struct HotCache {
    cache: Mutex<LruCache<TensorId, CachedTensor>>,
    capacity_bytes: u64,
    ttl: Duration,
    current_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl HotCache {
    /// Create a cache holding at most `capacity_bytes`
    pub fn new(capacity_bytes: u64, ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(LruCache::unbounded()),
            capacity_bytes,
            ttl,
            current_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cached bytes for `id` if they match `generation` and are fresh
    pub fn get(&self, id: TensorId, generation: u64) -> Option<Bytes> {
        let mut cache = self.cache.lock();
        let fresh = match cache.get(&id) {
            Some(entry) if entry.generation == generation && entry.inserted.elapsed() <= self.ttl => {
                Some(entry.data.clone())
            }
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match fresh {
            Some(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(data)
            }
            None => {
                // Stale: drop it so it stops occupying capacity.
                if let Some(stale) = cache.pop(&id) {
                    self.current_bytes
                        .fetch_sub(stale.data.len() as u64, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Cache a reassembled tensor
    ///
    /// Tensors larger than the whole cache are not cached.
    pub fn insert(&self, id: TensorId, generation: u64, data: Bytes) {
        let size = data.len() as u64;
        if size > self.capacity_bytes {
            return;
        }

        let mut cache = self.cache.lock();
        if let Some(old) = cache.pop(&id) {
            self.current_bytes
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
        }

        while self.current_bytes.load(Ordering::Relaxed) + size > self.capacity_bytes {
            match cache.pop_lru() {
                Some((_, evicted)) => {
                    self.current_bytes
                        .fetch_sub(evicted.data.len() as u64, Ordering::Relaxed);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        self.current_bytes.fetch_add(size, Ordering::Relaxed);
        cache.put(
            id,
            CachedTensor {
                data,
                generation,
                inserted: Instant::now(),
            },
        );
    }

    /// Drop any cached copy of `id`
    pub fn invalidate(&self, id: TensorId) {
        if let Some(old) = self.cache.lock().pop(&id) {
            self.current_bytes
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
        }
    }

    /// Whether a copy of `id` is cached (fresh or not)
    pub fn contains(&self, id: TensorId) -> bool {
        self.cache.lock().contains(&id)
    }

    /// Cached tensors
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes cached
    pub fn size_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Lookups that hit
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that missed
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries pushed out by capacity
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit ratio over all lookups
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(n: usize) -> Bytes {
        Bytes::from(vec![1u8; n])
    }

    #[test]
    fn test_hit_requires_matching_generation() {
        let cache = HotCache::new(1024, Duration::from_secs(30));
        let id = TensorId::new();
        cache.insert(id, 1, bytes(10));

        assert_eq!(cache.get(id, 1).unwrap().len(), 10);
        assert!(cache.get(id, 2).is_none());
        // Stale entry was dropped
        assert!(!cache.contains(id));
        assert_eq!(cache.size_bytes(), 0);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = HotCache::new(1024, Duration::from_millis(1));
        let id = TensorId::new();
        cache.insert(id, 0, bytes(10));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(id, 0).is_none());
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let cache = HotCache::new(100, Duration::from_secs(30));
        let (a, b, c) = (TensorId::new(), TensorId::new(), TensorId::new());
        cache.insert(a, 0, bytes(40));
        cache.insert(b, 0, bytes(40));
        // Touch a so b is least recently used
        assert!(cache.get(a, 0).is_some());
        cache.insert(c, 0, bytes(40));

        assert!(cache.contains(a));
        assert!(!cache.contains(b));
        assert!(cache.contains(c));
        assert_eq!(cache.size_bytes(), 80);
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_oversized_not_cached() {
        let cache = HotCache::new(10, Duration::from_secs(30));
        let id = TensorId::new();
        cache.insert(id, 0, bytes(11));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_and_replace() {
        let cache = HotCache::new(100, Duration::from_secs(30));
        let id = TensorId::new();
        cache.insert(id, 0, bytes(30));
        cache.insert(id, 1, bytes(20));
        assert_eq!(cache.size_bytes(), 20);

        cache.invalidate(id);
        assert_eq!(cache.size_bytes(), 0);
        assert!(cache.is_empty());
    }
}
