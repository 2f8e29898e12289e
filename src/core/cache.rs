//! TTL cache for routing lookups
//!
//! The catalog's (project, queue) -> pool mapping and the queue-exists fast
//! path are both read far more often than they change, so lookups go through
//! this short-TTL cache. Entries expire lazily on read; there is no
//! background sweeper. Staleness within the TTL is an accepted trade-off and
//! documented at the call sites.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Keyed cache where every entry shares one time-to-live.
pub struct TtlCache<K, V> {
    inner: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a live entry, evicting it if its deadline has passed.
    pub fn get(&self, key: &K) -> Option<V> {
        // Write lock so expired entries can be dropped in place.
        let mut guard = self.inner.write().unwrap();
        if let Some(entry) = guard.get(key) {
            if Instant::now() >= entry.expires_at {
                guard.remove(key);
                return None;
            }
            return Some(entry.value.clone());
        }
        None
    }

    pub fn put(&self, key: K, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.inner.write().unwrap().insert(key, entry);
    }

    /// Drop a single entry. Used when the source of truth is deleted so a
    /// concurrent reader never outlives the mapping by more than the TTL.
    pub fn purge(&self, key: &K) {
        self.inner.write().unwrap().remove(key);
    }

    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_purge() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("k".to_string(), 1u32);
        assert_eq!(cache.get(&"k".to_string()), Some(1));

        cache.purge(&"k".to_string());
        assert_eq!(cache.get(&"k".to_string()), None);
    }

    #[test]
    fn test_entries_expire() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache.put("k".to_string(), 1u32);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get(&"k".to_string()), None);
    }

    #[test]
    fn test_clear_drops_everything() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("a".to_string(), 1u32);
        cache.put("b".to_string(), 2u32);
        cache.clear();
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.get(&"b".to_string()), None);
    }
}
