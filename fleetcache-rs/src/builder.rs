//! Provides a builder which sets up a fleetcache node.
//!
//! Most components of a node are optional. A library user who only wants to use a
//! [Group](crate::group::Group) in-process doesn't need a server or a peer ring at all, whereas a
//! full node enables everything.
//!
//! # Example
//! Setting up a node with all features enabled:
//! ```no_run
//! # use fleetcache::builder::Builder;
//! # use fleetcache::groups::Groups;
//! # use fleetcache::group::loader_fn;
//! # use fleetcache::server::Server;
//! #[tokio::main]
//! async fn main() {
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Register the groups of this application...
//!     let _ = platform.require::<Groups>().create(
//!         "scores",
//!         loader_fn(|key: String| async move { Ok(key.into_bytes()) }),
//!     );
//!
//!     // Start the main event loop of the server...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::sync::Arc;

use crate::platform::Platform;
use crate::{init_logging, FLEETCACHE_REVISION, FLEETCACHE_VERSION};

/// Initializes a node by creating and installing the selected components.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    core_commands: bool,
    setup_config: bool,
    setup_commands: bool,
    setup_server: bool,
    setup_groups: bool,
    setup_peers: bool,
}

impl Builder {
    /// Creates a new builder with all components disabled.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables all components.
    ///
    /// Note that components added in a future version will then also be enabled by default.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.core_commands = true;
        self.setup_config = true;
        self.setup_commands = true;
        self.setup_server = true;
        self.setup_groups = true;
        self.setup_peers = true;

        self
    }

    /// Initializes **simplelog** to log to stdout.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the setup of the logging system after [enable_all()](Builder::enable_all).
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Terminates the platform on **CTRL-C** or **SIGHUP**. See [signals](crate::signals).
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables the signal listener after [enable_all()](Builder::enable_all).
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs the maintenance commands of the [core](crate::core) module.
    pub fn enable_core_commands(mut self) -> Self {
        self.core_commands = true;
        self
    }

    /// Disables the **core** commands after [enable_all()](Builder::enable_all).
    pub fn disable_core_commands(mut self) -> Self {
        self.core_commands = false;
        self
    }

    /// Installs a [Config](crate::config::Config) which reads **config/settings.yml**.
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables the **Config** after [enable_all()](Builder::enable_all).
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Installs a [CommandDictionary](crate::commands::CommandDictionary).
    pub fn enable_commands(mut self) -> Self {
        self.setup_commands = true;
        self
    }

    /// Disables the **CommandDictionary** after [enable_all()](Builder::enable_all).
    pub fn disable_commands(mut self) -> Self {
        self.setup_commands = false;
        self
    }

    /// Installs a [Server](crate::server::Server).
    ///
    /// Note that the event loop still has to be started via
    /// `platform.require::<Server>().event_loop().await`.
    pub fn enable_server(mut self) -> Self {
        self.setup_server = true;
        self
    }

    /// Disables the **Server** after [enable_all()](Builder::enable_all).
    pub fn disable_server(mut self) -> Self {
        self.setup_server = false;
        self
    }

    /// Installs the [Groups](crate::groups::Groups) registry and its commands.
    pub fn enable_groups(mut self) -> Self {
        self.setup_groups = true;
        self
    }

    /// Disables the **Groups** registry after [enable_all()](Builder::enable_all).
    pub fn disable_groups(mut self) -> Self {
        self.setup_groups = false;
        self
    }

    /// Installs a [PeerPool](crate::peers::PeerPool) which is configured via **peers.***.
    ///
    /// Groups created via the registry automatically use this pool to locate their peers.
    pub fn enable_peers(mut self) -> Self {
        self.setup_peers = true;
        self
    }

    /// Disables the **PeerPool** after [enable_all()](Builder::enable_all).
    pub fn disable_peers(mut self) -> Self {
        self.setup_peers = false;
        self
    }

    /// Builds the [Platform](crate::platform::Platform) with all enabled components registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. FLEETCACHE (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            FLEETCACHE_VERSION,
            FLEETCACHE_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            crate::config::install(platform.clone()).await;
        }

        if self.setup_server {
            let _ = crate::server::Server::install(&platform);
        }

        if self.setup_commands {
            let _ = crate::commands::CommandDictionary::install(&platform);

            if self.core_commands {
                crate::core::install(platform.clone());
            }
        }

        if self.setup_peers {
            let _ = crate::peers::PeerPool::install(&platform);
        }

        if self.setup_groups {
            let _ = crate::groups::Groups::install(&platform);
        }

        platform
    }
}
