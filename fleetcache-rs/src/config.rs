//! Contains the system configuration.
//!
//! The configuration is loaded from **config/settings.yml**. The file is checked for changes
//! every two seconds and reloaded once it was modified. Each component which depends on the
//! config should therefore attach itself to the [Config::notifier](Config::notifier) and
//! re-apply its settings whenever a change message is received. This way the memory limits of
//! the groups or the members of the peer ring can be changed without restarting any node.
//!
//! Note that the **Config** itself can be obtained from the **Platform** once and then kept
//! around. However, a [Handle](Handle) obtained via **Config::current()** should not be stored,
//! as it will not be updated once a new config has been loaded.
//!
//! # Examples
//!
//! Reading the config:
//! ```
//! # use fleetcache::config::Config;
//! let config = Config::new("somefile.yml");
//! config.load_from_string("
//! groups:
//!     scores:
//!         max_memory: 64m
//! ", None).unwrap();
//!
//! let handle = config.current();
//! assert_eq!(handle.query("groups.scores.max_memory").as_str(), Some("64m"));
//!
//! // Unknown paths yield a BadValue...
//! assert_eq!(handle.query("groups.unknown.max_memory").is_badvalue(), true);
//! ```
//!
//! Attaching a change listener:
//! ```no_run
//! # use fleetcache::builder::Builder;
//! # use fleetcache::config::Config;
//! # #[tokio::main]
//! # async fn main() {
//! # let platform = Builder::new().enable_config().build().await;
//! let config = platform.require::<Config>();
//! tokio::spawn(async move {
//!     let mut notifier = config.notifier();
//!     while notifier.recv().await.is_ok() {
//!         log::info!("Config update received...");
//!     }
//! });
//! # }
//! ```
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::sync::broadcast::error::RecvError;
use yaml_rust::{Yaml, YamlLoader};

use crate::platform::Platform;

/// Provides access to the system configuration.
///
/// Most probably a config instance is installed by the [Builder](crate::builder::Builder) and
/// can be obtained via `platform.require::<Config>()`.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// The message itself carries no information. Once it is received, the config has changed and
/// needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will neither load the file nor watch it for changes. This is done by
    /// [install](install).
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Hash(Default::default()), None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// Within docker the file might be an unmounted volume, which is presented as directory.
    /// Therefore we only accept regular files.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Reads the underlying file.
    ///
    /// Note that this is normally called by the framework and should not be invoked manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        let metadata = match tokio::fs::metadata(&self.filename).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                log::info!("Config file doesn't exist or is a directory. Skipping config load.");
                return Ok(());
            }
        };

        let data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        self.load_from_string(&data, metadata.modified().ok())
    }

    /// Validates and writes the given config into the underlying file.
    ///
    /// The change is picked up by the change monitor like any other modification of the file.
    ///
    /// # Example
    ///
    /// ```
    /// # use fleetcache::config::Config;
    /// # #[tokio::main]
    /// # async fn main() {
    /// let config = Config::new("fleetcache_test_config.yml");
    ///
    /// assert_eq!(config.store("
    /// server:
    ///     port: 12345
    /// ").await.is_ok(), true);
    ///
    /// assert_eq!(config.load().await.is_ok(), true);
    /// assert_eq!(config.current().query("server.port").as_i64(), Some(12345));
    ///
    /// // Writing an invalid config file is prevented...
    /// assert_eq!(config.store("server: \"test").await.is_err(), true);
    /// assert_eq!(config.load().await.is_ok(), true);
    /// assert_eq!(config.current().query("server.port").as_i64(), Some(12345));
    ///
    /// # let _ = std::fs::remove_file("fleetcache_test_config.yml");
    /// # }
    /// ```
    pub async fn store(&self, config: &str) -> anyhow::Result<()> {
        log::info!(
            "Programmatically updating the config file {}...",
            &self.filename
        );

        let _ = YamlLoader::load_from_str(config).context("Cannot parse config data")?;
        tokio::fs::write(&self.filename, config)
            .await
            .context("Failed to write to config file!")?;
        log::info!("Config has been updated successfully!");

        Ok(())
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is mostly used by tests. An invalid config is rejected and the current one is kept.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let docs = YamlLoader::load_from_str(data)
            .with_context(|| format!("Cannot parse config file {}", &self.filename))?;

        let doc = match docs.into_iter().next() {
            Some(doc @ Yaml::Hash(_)) => doc,
            _ => Yaml::Hash(Default::default()),
        };

        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the root of the currently loaded configuration.
    pub fn root(&self) -> &Yaml {
        &self.config.0
    }

    /// Resolves a dot separated path like "server.port".
    ///
    /// Returns **Yaml::BadValue** if any part of the path doesn't exist.
    pub fn query(&self, path: &str) -> &Yaml {
        path.split('.').fold(self.root(), |node, key| &node[key])
    }
}

/// Waits until the given notifier reports a change.
///
/// Never completes if there is no notifier (no config is installed) or once the config has been
/// dropped. This permits to use the notifier in a **select!** next to other events.
pub async fn wait_for_change(notifier: &mut Option<ChangeNotifier>) {
    loop {
        let closed = match notifier.as_mut() {
            Some(receiver) => matches!(receiver.recv().await, Err(RecvError::Closed)),
            None => futures::future::pending::<bool>().await,
        };

        if closed {
            *notifier = None;
        } else {
            return;
        }
    }
}

/// Renders a scalar config value as string.
///
/// YAML parses `port: 2410` as integer but `max_memory: 64m` as string, therefore settings which
/// are parsed by [fmt](crate::fmt) are read via this helper. Returns **None** for missing or
/// non-scalar values.
pub fn as_string(node: &Yaml) -> Option<String> {
    match node {
        Yaml::String(value) => Some(value.clone()),
        Yaml::Integer(value) => Some(value.to_string()),
        Yaml::Real(value) => Some(value.clone()),
        Yaml::Boolean(value) => Some(value.to_string()),
        _ => None,
    }
}

/// Creates and installs a **Config** for the given platform.
///
/// This reads **config/settings.yml** and starts a task which reloads the file once its last
/// modified date changes. Note that no structural comparison is performed, therefore each
/// listener has to handle partial changes gracefully.
///
/// This is called by the [Builder](crate::builder::Builder) unless the config is disabled.
pub async fn install(platform: Arc<Platform>) {
    let path = Path::new("config");
    if let Err(error) = tokio::fs::create_dir_all(path).await {
        log::warn!(
            "Failed to create config base directory {}: {}",
            path.to_string_lossy(),
            error
        )
    }

    let config = Arc::new(Config::new("config/settings.yml"));
    platform.register::<Config>(config.clone());

    if let Err(error) = config.load().await {
        log::error!("{:#}", error);
    }

    run_config_change_monitor(platform, config);
}

#[cfg(test)]
fn run_config_change_monitor(_platform: Arc<Platform>, _config: Arc<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(platform: Arc<Platform>, config: Arc<Config>) {
    crate::spawn!(async move {
        while platform.is_running() {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;

            let last_modified = config.last_modified().await;
            let last_loaded = config.config.load().1;

            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("System configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load system config: {:#}", error),
                }
            }
        }
    });
}
