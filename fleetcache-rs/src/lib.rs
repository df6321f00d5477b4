//! Fleetcache is a distributed read-through cache which spreads the responsibility for cached
//! values across a fleet of processes.
//!
//! # Introduction
//! Each value is identified by a **group** and a **key**. Every key is owned by exactly one
//! process of the fleet, which is determined via consistent hashing. A process which receives a
//! request for a key it doesn't own asks the owner (via RESP). Only the owner invokes the
//! application provided [Loader](group::Loader) and keeps the value in its size bounded LRU
//! cache. Concurrent requests for the same key are collapsed into a single load, so that a
//! popular but missing key doesn't stampede the backend.
//!
//! There are no writes, no invalidations and no expiry: once loaded, a value is only removed if
//! the memory budget of its group is exhausted.
//!
//! # Features
//! * **Read-through groups** with a byte budget per group ([group::Group]).
//! * **Call deduplication** per key ([flight::Flights]).
//! * **Consistent hashing** with virtual nodes ([hashring::HashRing]).
//! * **Peer transport** via the [RESP Protocol](https://redis.io/topics/protocol) which also
//!   permits to inspect a node using **redis-cli** ([peers], [groups]).
//! * **Reload-aware config** which re-applies memory budgets, timeouts and the peer list without a
//!   restart ([config]).
//! * **Maintenance commands** to inspect commands and connections ([core]).
//!
//! # Example
//! A group can be used in-process without any server:
//! ```
//! # use fleetcache::group::{loader_fn, Group, GroupSettings};
//! # #[tokio::main]
//! # async fn main() {
//! let group = Group::new(
//!     "scores",
//!     GroupSettings::default(),
//!     loader_fn(|key: String| async move { Ok(format!("score of {}", key).into_bytes()) }),
//! );
//!
//! let value = group.get("Tom").await.unwrap();
//! assert_eq!(value.to_string_lossy(), "score of Tom");
//! # }
//! ```
//!
//! Setting up a full node is done via the [Builder](builder::Builder). A runnable node can be
//! found in **fleetcache-io**.
#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
#![warn(missing_docs, unused_results)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod byteview;
pub mod commands;
pub mod config;
pub mod core;
pub mod flight;
pub mod fmt;
pub mod group;
pub mod groups;
pub mod hashring;
pub mod lru;
pub mod peers;
pub mod platform;
pub mod request;
pub mod response;
pub mod server;
pub mod signals;

/// Contains the version of the fleetcache library.
pub const FLEETCACHE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the fleetcache build being used.
pub const FLEETCACHE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// This is done by the [Builder](builder::Builder) unless disabled. Calling it several times is
/// fine, only the first call has an effect.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Executes the given future via `tokio::spawn` and drops the join handle.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate fleetcache;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     log::info!("Running in the background...");
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use redis::{Connection, RedisError};
    use std::sync::Mutex;
    use tokio::time::Duration;

    lazy_static::lazy_static! {
        /// Guards the test port 1503. Tests which start a server have to acquire this lock,
        /// all others can run in parallel.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }

    /// Executes a blocking Redis query against the test server on port 1503.
    ///
    /// The query runs via **spawn_blocking** so that the server (running in the same runtime)
    /// isn't blocked.
    pub async fn query_redis_async<T, Q>(query: Q) -> Option<T>
    where
        Q: FnOnce(&mut Connection) -> Result<T, RedisError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let result = tokio::task::spawn_blocking(|| {
            let client = redis::Client::open("redis://127.0.0.1:1503").unwrap();
            let mut con = client
                .get_connection_with_timeout(Duration::from_secs(5))
                .unwrap();
            query(&mut con)
        })
        .await;

        match result {
            Ok(Ok(result)) => Some(result),
            _ => None,
        }
    }
}
