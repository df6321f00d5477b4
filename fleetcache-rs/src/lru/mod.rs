//! Provides a size constrained LRU Cache.
//!
//! An LRU cache drops the least recently used entry if it is about to grow beyond the given
//! limit. The limit is expressed as allocated memory, which is the length of each key plus the
//! [ByteSize](ByteSize) of its value. Each cache can be equipped with an
//! [EvictionListener](EvictionListener) which is notified about every entry which had to make
//! room for new data.
//!
//! The [LRUCache](LRUCache) itself isn't thread safe. The [guarded](guarded) module wraps it into
//! a mutex so that it can be shared by all tasks which access a [Group](crate::group::Group).
pub mod guarded;
mod lru_cache;

pub use lru_cache::ByteSize;
pub use lru_cache::EvictionListener;
pub use lru_cache::LRUCache;
