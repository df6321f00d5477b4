//! Wraps an [LRUCache](crate::lru::LRUCache) so that it can be shared across tasks.
//!
//! A [GuardedCache](GuardedCache) is the local store of a [Group](crate::group::Group). Each
//! operation holds the lock only for the duration of a single cache access, therefore the lock
//! is never held across an await point.
//!
//! The underlying cache is only allocated on the first write. Reading from a cache which has
//! never been written to simply yields **None**.
use std::sync::Mutex;

use crate::byteview::ByteView;
use crate::lru::{EvictionListener, LRUCache};

/// Provides a thread safe LRU cache for [ByteView](ByteView) values.
///
/// # Examples
/// ```
/// # use fleetcache::lru::guarded::GuardedCache;
/// # use fleetcache::byteview::ByteView;
/// let cache = GuardedCache::new(1024, None);
/// assert_eq!(cache.get("Tom"), None);
///
/// cache.add("Tom", ByteView::from("630"));
/// assert_eq!(cache.get("Tom").unwrap().to_string(), "630");
/// ```
pub struct GuardedCache {
    inner: Mutex<Inner>,
}

struct Inner {
    max_memory: usize,
    on_evicted: Option<EvictionListener<ByteView>>,
    lru: Option<LRUCache<ByteView>>,
}

/// Provides a snapshot of the metrics of a [GuardedCache](GuardedCache).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Contains the number of entries in the cache.
    pub entries: usize,
    /// Contains the memory allocated by keys and values.
    pub allocated_memory: usize,
    /// Contains the memory limit or 0 if the cache is unbounded.
    pub max_memory: usize,
    /// Contains the number of lookups.
    pub reads: usize,
    /// Contains the number of lookups which found a value.
    pub hits: usize,
    /// Contains the number of writes.
    pub writes: usize,
    /// Contains the number of entries which have been evicted.
    pub evictions: usize,
}

impl GuardedCache {
    /// Creates a new cache which is limited to the given amount of memory (0 means unbounded).
    ///
    /// The optional listener is handed to the underlying [LRUCache](LRUCache) once it is
    /// created.
    pub fn new(max_memory: usize, on_evicted: Option<EvictionListener<ByteView>>) -> Self {
        GuardedCache {
            inner: Mutex::new(Inner {
                max_memory,
                on_evicted,
                lru: None,
            }),
        }
    }

    /// Returns the value stored for the given key, if present.
    ///
    /// Note that a hit marks the entry as most recently used.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        let mut inner = self.inner.lock().unwrap();
        inner.lru.as_mut()?.get(key).cloned()
    }

    /// Stores the given value for the given key.
    pub fn add(&self, key: &str, value: ByteView) {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let max_memory = inner.max_memory;
        let on_evicted = &mut inner.on_evicted;

        inner
            .lru
            .get_or_insert_with(|| LRUCache::new(max_memory, on_evicted.take()))
            .add(key.to_owned(), value);
    }

    /// Changes the memory limit of this cache.
    ///
    /// Shrinking the limit evicts entries right away.
    pub fn set_max_memory(&self, max_memory: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_memory = max_memory;
        if let Some(lru) = inner.lru.as_mut() {
            lru.set_max_memory(max_memory);
        }
    }

    /// Returns the current metrics of this cache.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        match inner.lru.as_ref() {
            Some(lru) => CacheStats {
                entries: lru.len(),
                allocated_memory: lru.allocated_memory(),
                max_memory: lru.max_memory(),
                reads: lru.reads(),
                hits: lru.hits(),
                writes: lru.writes(),
                evictions: lru.evictions(),
            },
            None => CacheStats {
                max_memory: inner.max_memory,
                ..CacheStats::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::byteview::ByteView;
    use crate::lru::guarded::GuardedCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn reading_an_untouched_cache_allocates_nothing() {
        let cache = GuardedCache::new(100, None);
        assert_eq!(cache.get("foo"), None);

        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.reads, 0);
        assert_eq!(stats.max_memory, 100);
    }

    #[test]
    fn shrinking_evicts_and_notifies() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        let cache = GuardedCache::new(
            0,
            Some(Box::new(move |_key: &str, _value: &ByteView| {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        for i in 0..10 {
            cache.add(&format!("key{}", i), ByteView::from("value"));
        }
        assert_eq!(cache.stats().entries, 10);

        // Each entry allocates 9 bytes, so only 3 fit...
        cache.set_max_memory(27);
        assert_eq!(cache.stats().entries, 3);
        assert_eq!(evictions.load(Ordering::SeqCst), 7);
        assert_eq!(cache.get("key9").unwrap().to_string(), "value");
        assert_eq!(cache.get("key0"), None);
    }

    #[test]
    fn the_limit_is_kept_for_lazily_created_stores() {
        let cache = GuardedCache::new(0, None);
        cache.set_max_memory(10);
        cache.add("a", ByteView::from("1234"));
        cache.add("b", ByteView::from("1234"));

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.allocated_memory, 10);
        assert_eq!(stats.max_memory, 10);
    }
}
