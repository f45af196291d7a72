use dashmap::DashMap;
use parking_lot::RwLock;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    last_accessed: Arc<RwLock<Instant>>,
}

/// Concurrent bounded cache with optional time-to-live.
///
/// Safe to share across request handlers; entries past their TTL are
/// dropped on read, and the least recently read entry is evicted when the
/// cache is full.
pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    max_size: usize,
    ttl: Option<Duration>,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_size: max_size.max(1),
            ttl: None,
        }
    }

    pub fn with_ttl(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size: max_size.max(1),
            ttl: Some(ttl),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let expired = {
            let entry = self.entries.get(key)?;
            match self.ttl {
                Some(ttl) if entry.inserted_at.elapsed() > ttl => true,
                _ => {
                    *entry.last_accessed.write() = Instant::now();
                    return Some(entry.value.clone());
                }
            }
        };

        // The read guard is released before removing, DashMap shards deadlock otherwise
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.evict_lru();
        }

        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_accessed: Arc::new(RwLock::new(now)),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| *entry.last_accessed.read())
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}
