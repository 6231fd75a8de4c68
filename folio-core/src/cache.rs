use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Keyed store shared across requests. Implementations must check expiry on
/// every read.
pub trait Cache<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn put(&self, key: &str, value: V, ttl: Duration);
    fn invalidate(&self, key: &str);
    fn clear(&self);
}

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) < self.ttl
    }
}

pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send> Cache<V> for TtlCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let fresh = entries.get(key)?.is_fresh(Instant::now());
        if fresh {
            entries.get(key).map(|entry| entry.value.clone())
        } else {
            entries.remove(key);
            None
        }
    }

    fn put(&self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.is_fresh(now));
        entries.insert(
            key.to_owned(),
            CacheEntry {
                value,
                stored_at: now,
                ttl,
            },
        );
    }

    fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = TtlCache::new();
        cache.put("a", 1u32, Duration::from_secs(60));
        assert_eq!(cache.get("a"), Some(1));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("a"), Some(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn put_drops_entries_that_were_never_read_again() {
        let cache = TtlCache::new();
        cache.put("a", 1u32, Duration::from_secs(1));
        cache.put("long", 2u32, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.put("b", 3u32, Duration::from_secs(1));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("long"), Some(2));
        assert_eq!(cache.get("b"), Some(3));
    }

    #[test]
    fn invalidate_and_clear_are_independent_per_key() {
        let cache = TtlCache::new();
        cache.put("a", "x".to_string(), Duration::from_secs(60));
        cache.put("b", "y".to_string(), Duration::from_secs(60));

        cache.invalidate("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some("y"));

        cache.clear();
        assert!(cache.is_empty());
    }
}
