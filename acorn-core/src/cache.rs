use std::collections::HashMap;
use std::num::NonZeroUsize;

use crate::nut::Nut;

/// Index-to-value cache policy for a Tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Bounded LRU; evicting never touches the trunk.
    Lru(usize),
    /// Keep everything that has been written or read.
    Unbounded,
    /// No caching; every crack goes to the trunk.
    Off,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::Lru(4096)
    }
}

/// Cache strategies hold decoded live records. Tombstones are never cached;
/// a delete invalidates.
pub trait CacheStrategy<T>: Send {
    fn get(&mut self, id: &str) -> Option<Nut<T>>;
    fn put(&mut self, nut: Nut<T>);
    fn invalidate(&mut self, id: &str);
    fn len(&self) -> usize;
    fn clear(&mut self);
}

pub(crate) fn build<T: Clone + Send + 'static>(policy: CachePolicy) -> Box<dyn CacheStrategy<T>> {
    match policy {
        CachePolicy::Lru(capacity) => Box::new(LruStrategy::new(capacity)),
        CachePolicy::Unbounded => Box::new(UnboundedCache::default()),
        CachePolicy::Off => Box::new(NoCache),
    }
}

/// Bounded LRU backed by `lru::LruCache`; O(1) touch and eviction.
pub struct LruStrategy<T> {
    inner: lru::LruCache<String, Nut<T>>,
}

impl<T> LruStrategy<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped to >= 1");
        LruStrategy {
            inner: lru::LruCache::new(capacity),
        }
    }
}

impl<T: Clone + Send> CacheStrategy<T> for LruStrategy<T> {
    fn get(&mut self, id: &str) -> Option<Nut<T>> {
        self.inner.get(id).cloned()
    }

    fn put(&mut self, nut: Nut<T>) {
        self.inner.put(nut.id.clone(), nut);
    }

    fn invalidate(&mut self, id: &str) {
        self.inner.pop(id);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn clear(&mut self) {
        self.inner.clear();
    }
}

pub struct UnboundedCache<T> {
    map: HashMap<String, Nut<T>>,
}

impl<T> Default for UnboundedCache<T> {
    fn default() -> Self {
        UnboundedCache {
            map: HashMap::new(),
        }
    }
}

impl<T: Clone + Send> CacheStrategy<T> for UnboundedCache<T> {
    fn get(&mut self, id: &str) -> Option<Nut<T>> {
        self.map.get(id).cloned()
    }

    fn put(&mut self, nut: Nut<T>) {
        self.map.insert(nut.id.clone(), nut);
    }

    fn invalidate(&mut self, id: &str) {
        self.map.remove(id);
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

pub struct NoCache;

impl<T: Clone + Send> CacheStrategy<T> for NoCache {
    fn get(&mut self, _id: &str) -> Option<Nut<T>> {
        None
    }

    fn put(&mut self, _nut: Nut<T>) {}

    fn invalidate(&mut self, _id: &str) {}

    fn len(&self) -> usize {
        0
    }

    fn clear(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn nut(id: &str, v: u64) -> Nut<u64> {
        Nut {
            id: id.into(),
            payload: Some(v),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            version: 1,
            expires_at: None,
            deleted: false,
        }
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let mut cache = LruStrategy::new(2);
        cache.put(nut("a", 1));
        cache.put(nut("b", 2));
        assert!(cache.get("a").is_some()); // touch a, b is now oldest
        cache.put(nut("c", 3));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidate_removes_without_touching_others() {
        let mut cache = LruStrategy::new(8);
        cache.put(nut("a", 1));
        cache.put(nut("b", 2));
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut cache = LruStrategy::new(0);
        cache.put(nut("a", 1));
        assert_eq!(cache.len(), 1);
    }
}
