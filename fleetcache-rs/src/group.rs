//! Provides a named cache which loads missing values on demand.
//!
//! A [Group](Group) is the central building block of fleetcache. It combines a size constrained
//! local cache with a [Loader](Loader) which computes values for keys which are not present.
//! If the group knows about its peers (see [register_peers](Group::register_peers)), it first asks
//! the [PeerPicker](PeerPicker) which peer owns the requested key. If this is another peer, the
//! value is fetched from there. Only if there is no owner, or if the owner is the local node
//! itself, or if fetching from the owner fails, the local loader is invoked.
//!
//! Concurrent misses for the same key are collapsed into a single load using
//! [Flights](crate::flight::Flights). Therefore a burst of requests for a missing key only hits
//! the backend (or the owning peer) once.
//!
//! Values obtained by the local loader are put into the local cache. Values fetched from a peer
//! are not, as the owning peer caches them itself.
//!
//! # Example
//!
//! ```
//! # use fleetcache::group::{loader_fn, Group, GroupSettings};
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let group = Group::new(
//!     "scores",
//!     GroupSettings::default(),
//!     loader_fn(|key: String| async move {
//!         match key.as_str() {
//!             "Tom" => Ok(b"630".to_vec()),
//!             _ => Err(anyhow::anyhow!("{} not exist", key)),
//!         }
//!     }),
//! );
//!
//! assert_eq!(group.get("Tom").await.unwrap().to_string(), "630");
//! assert_eq!(group.get("Sam").await.is_err(), true);
//! # });
//! ```
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;

use crate::average::Average;
use crate::byteview::ByteView;
use crate::flight::Flights;
use crate::fmt::format_duration;
use crate::lru::guarded::{CacheStats, GuardedCache};
use crate::lru::EvictionListener;

/// Computes the value for a key which isn't present in the cache.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Loads the data for the given key from the underlying data source.
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

struct LoaderFn<F>(F);

#[async_trait]
impl<F, R> Loader for LoaderFn<F>
where
    F: Fn(String) -> R + Send + Sync,
    R: Future<Output = anyhow::Result<Vec<u8>>> + Send,
{
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        (self.0)(key.to_owned()).await
    }
}

/// Turns the given closure into a [Loader](Loader).
pub fn loader_fn<F, R>(loader: F) -> Arc<dyn Loader>
where
    F: Fn(String) -> R + Send + Sync + 'static,
    R: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
{
    Arc::new(LoaderFn(loader))
}

/// Locates the peer which owns a key.
pub trait PeerPicker: Send + Sync {
    /// Returns the fetcher of the peer owning the given key.
    ///
    /// Returns **None** if there are no peers or if the local node owns the key.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerFetcher>>;
}

/// Fetches values from a remote peer.
///
/// The [Display](std::fmt::Display) implementation should yield the address of the peer so that
/// failures can be logged properly.
#[async_trait]
pub trait PeerFetcher: Display + Send + Sync {
    /// Fetches the value of the given key in the given group from the peer.
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Bytes>;
}

/// Represents the errors reported by [Group::get](Group::get).
///
/// As the outcome of a load is shared by all callers waiting for it, this error is cheap to
/// clone.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// The requested key was empty.
    EmptyKey,
    /// The loader failed to provide a value.
    LoadFailed(Arc<anyhow::Error>),
    /// The loader didn't complete within the configured timeout.
    Timeout(Duration),
    /// The load panicked.
    Panicked(String),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::EmptyKey => write!(f, "A key is required"),
            CacheError::LoadFailed(error) => write!(f, "Failed to load the value: {}", error),
            CacheError::Timeout(timeout) => write!(
                f,
                "Failed to load the value within {}",
                format_duration(*timeout)
            ),
            CacheError::Panicked(message) => {
                write!(f, "Loading the value panicked: {}", message)
            }
        }
    }
}

impl Error for CacheError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CacheError::LoadFailed(error) => Some(&***error),
            _ => None,
        }
    }
}

impl PartialEq for CacheError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CacheError::EmptyKey, CacheError::EmptyKey) => true,
            (CacheError::LoadFailed(a), CacheError::LoadFailed(b)) => {
                Arc::ptr_eq(a, b) || a.to_string() == b.to_string()
            }
            (CacheError::Timeout(a), CacheError::Timeout(b)) => a == b,
            (CacheError::Panicked(a), CacheError::Panicked(b)) => a == b,
            _ => false,
        }
    }
}

/// Contains the settings used to create a [Group](Group).
#[derive(Default)]
pub struct GroupSettings {
    /// Limits the memory allocated by the keys and values of the local cache (0 = unbounded).
    pub max_memory: usize,

    /// Limits the duration of a peer fetch or local load. **None** waits forever.
    pub timeout: Option<Duration>,

    /// Is notified about each entry evicted from the local cache.
    ///
    /// The listener is invoked while the cache is locked and therefore must not access the
    /// group itself.
    pub on_evicted: Option<EvictionListener<ByteView>>,
}

#[derive(Default)]
struct Metrics {
    gets: AtomicU64,
    cache_hits: AtomicU64,
    loads: AtomicU64,
    peer_loads: AtomicU64,
    peer_errors: AtomicU64,
    local_loads: AtomicU64,
    local_load_errors: AtomicU64,
    load_duration: Average,
}

fn inc(counter: &AtomicU64) {
    let _ = counter.fetch_add(1, Ordering::Relaxed);
}

/// Provides a snapshot of the metrics of a [Group](Group).
#[derive(Clone)]
pub struct GroupStats {
    /// Contains the number of calls to [Group::get](Group::get).
    pub gets: u64,
    /// Contains the number of gets served from the local cache.
    pub cache_hits: u64,
    /// Contains the number of loads performed (after deduplication).
    pub loads: u64,
    /// Contains the number of callers which joined a load in flight.
    pub loads_deduped: u64,
    /// Contains the number of attempts to fetch a value from a peer.
    pub peer_loads: u64,
    /// Contains the number of failed peer fetches.
    pub peer_errors: u64,
    /// Contains the number of invocations of the local loader.
    pub local_loads: u64,
    /// Contains the number of failed (or timed out) local loads.
    pub local_load_errors: u64,
    /// Contains the average duration of the local loader.
    pub load_duration: Average,
    /// Contains the metrics of the local cache.
    pub cache: CacheStats,
}

/// Represents a named cache along with the loader which provides missing values.
pub struct Group {
    name: String,
    cache: GuardedCache,
    loader: Arc<dyn Loader>,
    peers: OnceLock<Arc<dyn PeerPicker>>,
    flights: Flights<ByteView>,
    local_flights: Flights<ByteView>,
    timeout: ArcSwap<Option<Duration>>,
    metrics: Metrics,
}

impl Group {
    /// Creates a new group with the given name, settings and loader.
    ///
    /// Note that groups are most probably created via
    /// [Groups::create](crate::groups::Groups::create) so that they are visible to other peers
    /// and are configured by the system config.
    pub fn new(
        name: impl Into<String>,
        settings: GroupSettings,
        loader: Arc<dyn Loader>,
    ) -> Self {
        Group {
            name: name.into(),
            cache: GuardedCache::new(settings.max_memory, settings.on_evicted),
            loader,
            peers: OnceLock::new(),
            flights: Flights::new(),
            local_flights: Flights::new(),
            timeout: ArcSwap::new(Arc::new(settings.timeout)),
            metrics: Metrics::default(),
        }
    }

    /// Returns the name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the picker used to locate the owner of a key.
    ///
    /// # Panics
    ///
    /// Panics if a picker has already been registered for this group.
    pub fn register_peers(&self, peers: Arc<dyn PeerPicker>) {
        if self.peers.set(peers).is_err() {
            panic!("Peers have already been registered for group {}!", self.name);
        }
    }

    /// Changes the memory limit of the local cache.
    pub fn set_max_memory(&self, max_memory: usize) {
        self.cache.set_max_memory(max_memory);
    }

    /// Changes the timeout applied to peer fetches and local loads.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.timeout.store(Arc::new(timeout));
    }

    /// Returns the timeout applied to peer fetches and local loads.
    pub fn timeout(&self) -> Option<Duration> {
        **self.timeout.load()
    }

    /// Returns the value for the given key.
    ///
    /// The value is either served from the local cache or loaded as described in the
    /// [module documentation](crate::group).
    pub async fn get(&self, key: &str) -> Result<ByteView, CacheError> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }

        inc(&self.metrics.gets);
        if let Some(value) = self.lookup(key) {
            return Ok(value);
        }

        self.flights.run(key, self.load(key)).await
    }

    /// Returns the value for the given key without consulting any peer.
    ///
    /// This serves the requests of other nodes which consider this node the owner of the key.
    /// Such requests are never forwarded again and run in flights of their own. Otherwise two
    /// nodes which temporarily disagree on the owner of a key (e.g. while a new peer list is
    /// rolled out) could end up waiting on each other.
    pub async fn get_locally(&self, key: &str) -> Result<ByteView, CacheError> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }

        inc(&self.metrics.gets);
        if let Some(value) = self.lookup(key) {
            return Ok(value);
        }

        self.local_flights
            .run(key, self.load_without_peers(key))
            .await
    }

    fn lookup(&self, key: &str) -> Option<ByteView> {
        let value = self.cache.get(key)?;
        log::debug!("[{}] Cache hit for {}", self.name, key);
        inc(&self.metrics.cache_hits);

        Some(value)
    }

    async fn load(&self, key: &str) -> Result<ByteView, CacheError> {
        // A flight for this key might have completed right before we started ours...
        if let Some(value) = self.lookup(key) {
            return Ok(value);
        }

        inc(&self.metrics.loads);
        if let Some(peer) = self.peers.get().and_then(|peers| peers.pick_peer(key)) {
            match self.fetch_from_peer(peer.as_ref(), key).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    inc(&self.metrics.peer_errors);
                    log::warn!(
                        "[{}] Failed to fetch {} from peer {}: {:#}",
                        self.name,
                        key,
                        peer,
                        error
                    );
                }
            }
        }

        self.load_locally(key).await
    }

    async fn load_without_peers(&self, key: &str) -> Result<ByteView, CacheError> {
        if let Some(value) = self.lookup(key) {
            return Ok(value);
        }

        inc(&self.metrics.loads);
        self.load_locally(key).await
    }

    async fn fetch_from_peer(
        &self,
        peer: &dyn PeerFetcher,
        key: &str,
    ) -> anyhow::Result<ByteView> {
        log::debug!("[{}] Fetching {} from peer {}", self.name, key, peer);
        inc(&self.metrics.peer_loads);

        let fetch = peer.fetch(&self.name, key);
        let data = match self.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, fetch)
                .await
                .with_context(|| format!("No response within {}", format_duration(timeout)))??,
            None => fetch.await?,
        };

        Ok(ByteView::from(data))
    }

    async fn load_locally(&self, key: &str) -> Result<ByteView, CacheError> {
        log::debug!("[{}] Loading {} locally", self.name, key);
        inc(&self.metrics.local_loads);

        let watch = Instant::now();
        let load = self.loader.load(key);
        let result = match self.timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, load).await {
                Ok(result) => result,
                Err(_) => {
                    inc(&self.metrics.local_load_errors);
                    return Err(CacheError::Timeout(timeout));
                }
            },
            None => load.await,
        };
        self.metrics
            .load_duration
            .add(watch.elapsed().as_micros() as u64);

        match result {
            Ok(data) => {
                let value = ByteView::from(data);
                self.cache.add(key, value.clone());
                Ok(value)
            }
            Err(error) => {
                inc(&self.metrics.local_load_errors);
                log::debug!("[{}] Failed to load {}: {:#}", self.name, key, error);
                Err(CacheError::LoadFailed(Arc::new(error)))
            }
        }
    }

    /// Returns the current metrics of this group.
    pub fn stats(&self) -> GroupStats {
        let metrics = &self.metrics;
        GroupStats {
            gets: metrics.gets.load(Ordering::Relaxed),
            cache_hits: metrics.cache_hits.load(Ordering::Relaxed),
            loads: metrics.loads.load(Ordering::Relaxed),
            loads_deduped: (self.flights.shared() + self.local_flights.shared()) as u64,
            peer_loads: metrics.peer_loads.load(Ordering::Relaxed),
            peer_errors: metrics.peer_errors.load(Ordering::Relaxed),
            local_loads: metrics.local_loads.load(Ordering::Relaxed),
            local_load_errors: metrics.local_load_errors.load(Ordering::Relaxed),
            load_duration: metrics.load_duration.clone(),
            cache: self.cache.stats(),
        }
    }
}
