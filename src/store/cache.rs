use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A bounded cache with least-recently-used eviction and a per-entry
/// time-to-live, fronting durable store reads.
///
/// Small and single-purpose on purpose: capacity is a few hundred entries,
/// so the O(capacity) recency scan on insert is noise next to the store
/// round-trip it saves.
pub struct TtlCache<V> {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, Entry<V>>,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_used: Instant,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> TtlCache<V> {
        assert!(capacity > 0, "cache capacity must be nonzero");

        TtlCache {
            capacity,
            ttl,
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = Instant::now();

        let entry = self.entries.get_mut(key)?;
        if now.duration_since(entry.inserted_at) >= self.ttl {
            self.entries.remove(key);
            return None;
        }

        entry.last_used = now;
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: String, value: V) {
        let now = Instant::now();

        // Expired entries go first; they'd be dead weight either way.
        self.entries
            .retain(|_, entry| now.duration_since(entry.inserted_at) < self.ttl);

        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            {
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                last_used: now,
            },
        );
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
