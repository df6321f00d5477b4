//! Provides a tiny DI like container which exposes all central components of a node.
//!
//! Components like the [Config](crate::config::Config), the
//! [Groups](crate::groups::Groups) registry or the [PeerPool](crate::peers::PeerPool) are
//! registered here once at startup and are looked up by their type thereafter. The platform
//! also carries the central **is_running** flag, which is toggled to *false* once
//! [Platform::terminate](Platform::terminate) is invoked. Background tasks use this flag to
//! determine when to stop.
//!
//! Note that all services are released once the platform is terminated. Code which might run
//! during shutdown should therefore use [Platform::find](Platform::find) rather than
//! [Platform::require](Platform::require).
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use fleetcache::platform::Platform;
//! struct Registry {
//!     size: usize,
//! }
//!
//! struct Unknown;
//!
//! let platform = Platform::new();
//! platform.register::<Registry>(Arc::new(Registry { size: 42 }));
//!
//! assert_eq!(platform.require::<Registry>().size, 42);
//! assert_eq!(platform.find::<Unknown>().is_none(), true);
//!
//! // Terminating the platform releases all services...
//! platform.terminate();
//! assert_eq!(platform.find::<Registry>().is_none(), true);
//! assert_eq!(platform.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Keeps all central services of a node in a single place.
pub struct Platform {
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    is_running: AtomicBool,
}

impl Platform {
    /// Creates a new and running platform.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            services: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        })
    }

    /// Registers a service. A previously registered service of the same type is replaced.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self
            .services
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), service);
    }

    /// Resolves a previously registered service or returns **None** if it isn't available.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.services
            .lock()
            .unwrap()
            .get(&TypeId::of::<T>())
            .and_then(|service| service.clone().downcast::<T>().ok())
    }

    /// Resolves a service which is known to be present.
    ///
    /// # Panics
    /// Panics if the requested service isn't available or if the platform is already shutting
    /// down.
    ///
    /// ```should_panic
    /// # use fleetcache::platform::Platform;
    /// struct Unknown;
    ///
    /// let platform = Platform::new();
    /// platform.require::<Unknown>();
    /// ```
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if !self.is_running() {
            panic!(
                "A required component ({}) has been requested but the system is shutting down!",
                std::any::type_name::<T>()
            );
        }

        match self.find::<T>() {
            Some(service) => service,
            None => panic!(
                "A required component ({}) was not available in the platform registry!",
                std::any::type_name::<T>()
            ),
        }
    }

    /// Determines if the platform is still running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the platform and releases all services.
    pub fn terminate(&self) {
        self.services.lock().unwrap().clear();
        self.is_running.store(false, Ordering::Release);
    }
}
