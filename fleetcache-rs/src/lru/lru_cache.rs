use linked_hash_map::LinkedHashMap;

/// Returns the allocated memory in bytes.
pub trait ByteSize {
    /// Returns the amount of allocated memory in bytes.
    ///
    /// Note that most probably this is an approximation and not the exact byte value. However,
    /// it should represent the "largest" part of an instance. (E.g. for a string, this would
    /// be the bytes of its contents and might discard the fields allocated on the stack
    /// used to store the length and capacity as well as the pointer itself.
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.len()
    }
}

/// Represents a callback which is notified about each entry being evicted from a cache.
///
/// The callback is invoked synchronously while the entry is removed.
pub type EvictionListener<V> = Box<dyn FnMut(&str, &V) + Send>;

/// Provides a size constrained LRU cache.
///
/// A cache behaves just like a **Map** as long as there is no shortage in storage. However, if
/// the allocated memory (the length of each key plus the size of its value) grows above the
/// given limit, old (least recently used) entries will be evicted - hence the name LRU cache.
/// A limit of **0** disables this constraint.
///
/// Note that only [get](LRUCache::get) marks an entry as recently used. Replacing the value
/// of an existing key via [add](LRUCache::add) keeps its position.
///
/// # Examples
/// ```
/// # use fleetcache::lru::LRUCache;
/// // Specifies a cache which can allocate up to 1024 bytes of memory...
/// let mut lru = LRUCache::new(1024, None);
///
/// lru.add("Foo".to_owned(), "Bar".to_owned());
/// assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
///
/// // this will still fit..
/// lru.add("Foo1".to_owned(), "X".repeat(512));
/// assert_eq!(lru.get("Foo").is_some(), true);
/// assert_eq!(lru.get("Foo1").is_some(), true);
///
/// // this will hit the max memory constraint...
/// lru.add("Foo2".to_owned(), "X".repeat(512));
/// // ..and therefore will throw the two others out:
/// assert_eq!(lru.get("Foo").is_some(), false);
/// assert_eq!(lru.get("Foo1").is_some(), false);
/// assert_eq!(lru.get("Foo2").is_some(), true);
///```
pub struct LRUCache<V: ByteSize> {
    allocated_memory: usize,
    max_memory: usize,
    reads: usize,
    hits: usize,
    writes: usize,
    evictions: usize,
    map: LinkedHashMap<String, Entry<V>>,
    on_evicted: Option<EvictionListener<V>>,
}

struct Entry<V: ByteSize> {
    mem_size: usize,
    value: V,
}

impl<V: ByteSize> LRUCache<V> {
    /// Creates a new cache which can store entries until they allocated **max_memory** bytes.
    ///
    /// If an **on_evicted** callback is given, it is invoked for each entry which is dropped
    /// to make room for new entries.
    ///
    /// # Examples
    /// ```
    /// # use fleetcache::lru::LRUCache;
    /// # use std::sync::{Arc, Mutex};
    /// let evicted = Arc::new(Mutex::new(Vec::new()));
    /// let log = evicted.clone();
    /// let mut lru = LRUCache::new(8, Some(Box::new(move |key: &str, _value: &String| {
    ///     log.lock().unwrap().push(key.to_owned());
    /// })));
    ///
    /// lru.add("A".to_owned(), "123".to_owned());
    /// lru.add("B".to_owned(), "123".to_owned());
    /// lru.add("C".to_owned(), "123".to_owned());
    ///
    /// assert_eq!(*evicted.lock().unwrap(), vec!["A".to_owned()]);
    ///```
    pub fn new(max_memory: usize, on_evicted: Option<EvictionListener<V>>) -> Self {
        LRUCache {
            allocated_memory: 0,
            max_memory,
            reads: 0,
            hits: 0,
            writes: 0,
            evictions: 0,
            map: LinkedHashMap::new(),
            on_evicted,
        }
    }

    /// Stores the given value for the given key.
    ///
    /// A new key is placed at the most recently used position. If the key is already present,
    /// its value is replaced in place. Afterwards, the least recently used entries are evicted
    /// until the cache fits into **max_memory** again. Note that an entry which alone is larger
    /// than the whole cache is therefore evicted right away.
    ///
    /// # Examples
    /// ```
    /// # use fleetcache::lru::LRUCache;
    /// let mut lru = LRUCache::new(4, None);
    ///
    /// // This entry is larger than the whole cache...
    /// lru.add("Foo".to_owned(), "Bar".to_owned());
    ///
    /// // ...and therefore immediately gone again.
    /// assert_eq!(lru.get("Foo"), None);
    /// assert_eq!(lru.is_empty(), true);
    /// ```
    pub fn add(&mut self, key: String, value: V) {
        self.writes += 1;

        let mem_size = key.len() + value.allocated_size();
        if let Some(entry) = self.map.get_mut(&key) {
            self.allocated_memory = self.allocated_memory + mem_size - entry.mem_size;
            entry.mem_size = mem_size;
            entry.value = value;
        } else {
            self.allocated_memory += mem_size;
            let _ = self.map.insert(key, Entry { mem_size, value });
        }

        self.enforce_constraints();
    }

    fn enforce_constraints(&mut self) {
        while self.max_memory > 0 && self.allocated_memory > self.max_memory {
            if !self.remove_oldest() {
                unreachable!("Failed to enforce constraints of a LRU cache!");
            }
        }
    }

    /// Evicts the least recently used entry.
    ///
    /// Returns **true** if an entry was removed or **false** if the cache was empty.
    pub fn remove_oldest(&mut self) -> bool {
        match self.map.pop_front() {
            Some((key, entry)) => {
                self.allocated_memory -= entry.mem_size;
                self.evictions += 1;
                if let Some(on_evicted) = self.on_evicted.as_mut() {
                    on_evicted(&key, &entry.value);
                }

                true
            }
            None => false,
        }
    }

    /// Returns the value which has previously been stored for the given key or **None** if
    /// no value is present.
    ///
    /// A successful lookup marks the entry as most recently used.
    ///
    /// # Examples
    /// ```
    /// # use fleetcache::lru::LRUCache;
    /// let mut lru = LRUCache::new(1024, None);
    ///
    /// // After inserting a value...
    /// lru.add("Foo".to_owned(), "Bar".to_owned());
    /// // ..it can be retrieved.
    /// assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
    ///```
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.reads += 1;

        match self.map.get_refresh(key) {
            Some(entry) => {
                self.hits += 1;
                Some(&entry.value)
            }
            None => None,
        }
    }

    /// Returns the number of elements in the cache.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the maximal amount of memory to be (roughly) occupied by this cache.
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Specifies the maximal amount of memory to be (roughly) occupied by this cache.
    ///
    /// If the limit is reduced, entries are evicted right away.
    ///
    /// # Examples
    /// ```
    /// # use fleetcache::lru::LRUCache;
    /// let mut lru = LRUCache::new(1024, None);
    ///
    /// // Add some entries of 7 bytes each...
    /// lru.add("Foo0".to_owned(), "Bar".to_owned());
    /// lru.add("Foo1".to_owned(), "Bar".to_owned());
    /// lru.add("Foo2".to_owned(), "Bar".to_owned());
    /// assert_eq!(lru.len(), 3);
    ///
    /// // Now request that the cache is reduced to only 14 bytes...
    /// lru.set_max_memory(14);
    ///
    /// // .. this will kick each but the last two entries out of the cache..
    /// assert_eq!(lru.len(), 2);
    /// ```
    pub fn set_max_memory(&mut self, max_memory: usize) {
        self.max_memory = max_memory;
        self.enforce_constraints();
    }

    /// Returns the amount of memory allocated to store the data of the keys and values of this
    /// cache.
    pub fn allocated_memory(&self) -> usize {
        self.allocated_memory
    }

    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            n => self.hits as f32 / n as f32 * 100.,
        }
    }

    /// Returns the total number of reads performed on this cache.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Returns the number of reads which found a value.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Returns the total number of writes performed on this cache.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the number of entries which have been evicted.
    pub fn evictions(&self) -> usize {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use crate::lru::LRUCache;
    use std::sync::{Arc, Mutex};

    fn recording_cache(max_memory: usize) -> (LRUCache<String>, Arc<Mutex<Vec<String>>>) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = evicted.clone();
        let lru = LRUCache::new(
            max_memory,
            Some(Box::new(move |key: &str, _value: &String| {
                log.lock().unwrap().push(key.to_owned());
            })),
        );

        (lru, evicted)
    }

    #[test]
    fn unbounded_cache_returns_stored_values() {
        let mut lru = LRUCache::new(0, None);
        lru.add("key1".to_owned(), "1234".to_owned());

        assert_eq!(lru.get("key1").unwrap(), "1234");
        assert_eq!(lru.get("key2"), None);
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let mut lru = LRUCache::new(10, None);
        lru.add("key1".to_owned(), "1".to_owned());
        lru.add("key2".to_owned(), "1".to_owned());
        lru.add("k".to_owned(), "1".to_owned());

        assert_eq!(lru.get("key1"), None);
        assert_eq!(lru.get("key2").is_some(), true);
        assert_eq!(lru.get("k").is_some(), true);
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn reading_an_entry_saves_it_from_eviction() {
        let mut lru = LRUCache::new(12, None);
        lru.add("key1".to_owned(), "11".to_owned());
        lru.add("key2".to_owned(), "11".to_owned());

        // "key1" is now the most recently used entry...
        let _ = lru.get("key1");
        lru.add("key3".to_owned(), "11".to_owned());

        assert_eq!(lru.get("key1").is_some(), true);
        assert_eq!(lru.get("key2"), None);
        assert_eq!(lru.get("key3").is_some(), true);
    }

    #[test]
    fn replacing_a_value_keeps_its_position() {
        let mut lru = LRUCache::new(12, None);
        lru.add("key1".to_owned(), "11".to_owned());
        lru.add("key2".to_owned(), "11".to_owned());

        // Updating "key1" doesn't count as access...
        lru.add("key1".to_owned(), "22".to_owned());
        lru.add("key3".to_owned(), "11".to_owned());

        assert_eq!(lru.get("key1"), None);
        assert_eq!(lru.get("key2").unwrap(), "11");
        assert_eq!(lru.get("key3").unwrap(), "11");
    }

    #[test]
    fn eviction_callback_fires_once_per_evicted_key() {
        let (mut lru, evicted) = recording_cache(10);
        lru.add("key1".to_owned(), "11".to_owned());
        lru.add("key2".to_owned(), "11".to_owned());
        lru.add("key3".to_owned(), "11".to_owned());
        lru.add("key3".to_owned(), "11".to_owned());

        assert_eq!(
            *evicted.lock().unwrap(),
            vec!["key1".to_owned(), "key2".to_owned()]
        );
        assert_eq!(lru.evictions(), 2);
    }

    #[test]
    fn oversized_entries_evict_themselves() {
        let (mut lru, evicted) = recording_cache(4);
        lru.add("key1".to_owned(), "12345".to_owned());

        assert_eq!(lru.is_empty(), true);
        assert_eq!(lru.allocated_memory(), 0);
        assert_eq!(*evicted.lock().unwrap(), vec!["key1".to_owned()]);
    }

    #[test]
    fn max_memory_is_never_exceeded() {
        let mut lru = LRUCache::new(64, None);
        for i in 0..500 {
            let key = format!("key{}", i % 37);
            let value = "X".repeat((i * 7) % 23);
            lru.add(key, value);

            assert_eq!(lru.allocated_memory() <= 64, true);
            assert_eq!(lru.is_empty(), lru.allocated_memory() == 0);
        }
    }

    #[test]
    fn replacing_values_updates_the_allocated_memory() {
        let mut lru = LRUCache::new(1024, None);
        lru.add("Hello0".to_owned(), "World0".to_owned());
        lru.add("Hello1".to_owned(), "World1".to_owned());
        assert_eq!(lru.allocated_memory(), 24);

        lru.add("Hello1".to_owned(), "".to_owned());
        assert_eq!(lru.allocated_memory(), 18);

        lru.add("Hello1".to_owned(), "World1!".to_owned());
        assert_eq!(lru.allocated_memory(), 25);
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn metrics_are_computed_correctly() {
        let mut lru = LRUCache::new(10, None);

        // Write 3 values into the cache...
        lru.add("A".to_owned(), "A".to_owned());
        lru.add("B".to_owned(), "B".to_owned());
        lru.add("C".to_owned(), "C".to_owned());

        // Perform 4 reads, of which 3 hit a cache entry...
        assert_eq!(lru.get("A").is_some(), true);
        assert_eq!(lru.get("B").is_some(), true);
        assert_eq!(lru.get("C").is_some(), true);
        assert_eq!(lru.get("D").is_none(), true);

        // ... therefore we had 3 writes, 4 reads of which 3 hit a value which
        // yields a hit rate of 75%
        assert_eq!(lru.writes(), 3);
        assert_eq!(lru.reads(), 4);
        assert_eq!(lru.hits(), 3);
        assert_eq!(lru.hit_rate().round() as i32, 75);

        // We know our keys and values consume 6 bytes...
        assert_eq!(lru.allocated_memory(), 6);
        assert_eq!(lru.evictions(), 0);
    }
}
