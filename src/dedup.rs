use std::collections::HashMap;

/// Deduplication interval of FIFO queues and topics.
pub const DEDUP_WINDOW_MILLIS: i64 = 5 * 60 * 1000;

/// Remembers the outcome of the first accepted send per deduplication key for
/// five minutes; later sends with the same key get that outcome back.
#[derive(Debug)]
pub struct DedupCache<T> {
    entries: HashMap<String, (T, i64)>,
}

impl<T: Clone> DedupCache<T> {
    pub fn new() -> Self {
        DedupCache {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str, now: i64) -> Option<T> {
        self.entries
            .get(key)
            .filter(|(_, first_seen)| now - first_seen < DEDUP_WINDOW_MILLIS)
            .map(|(outcome, _)| outcome.clone())
    }

    pub fn insert(&mut self, key: String, outcome: T, now: i64) {
        self.entries.insert(key, (outcome, now));
    }

    pub fn evict_expired(&mut self, now: i64) {
        self.entries
            .retain(|_, (_, first_seen)| now - *first_seen < DEDUP_WINDOW_MILLIS);
    }
}

impl<T: Clone> Default for DedupCache<T> {
    fn default() -> Self {
        DedupCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_after_window() {
        let mut cache = DedupCache::new();
        cache.insert("d1".into(), "m1".to_string(), 1_000);
        assert_eq!(cache.get("d1", 1_000 + DEDUP_WINDOW_MILLIS - 1).as_deref(), Some("m1"));
        assert_eq!(cache.get("d1", 1_000 + DEDUP_WINDOW_MILLIS), None);

        // Evicted entries are gone even for lookups inside their old window.
        cache.evict_expired(1_000 + DEDUP_WINDOW_MILLIS);
        assert_eq!(cache.get("d1", 1_000), None);
    }
}
