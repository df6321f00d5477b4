//! Provides the registry of all cache groups of a node.
//!
//! Groups are created once at startup via [Groups::create](Groups::create) and looked up by name
//! thereafter. They are never removed. Each group picks up its settings from the config:
//!
//! ```yaml
//! groups:
//!     scores:
//!         # Limits the memory used by keys and values (supports k, m, g, t suffixes).
//!         max_memory: 64m
//!         # Limits the duration of peer fetches and local loads (ms, s, m, h, d).
//!         timeout: 5s
//! ```
//!
//! Without a timeout, a fetch from an unresponsive peer waits until the connection fails.
//! Configuring one is therefore recommended whenever peers are in use.
//!
//! These settings are re-applied whenever the config changes. If a [PeerPool](PeerPool) is
//! installed, it is registered as peer picker for each group.
//!
//! The registry also provides the commands by which peers and administrators access the groups:
//! * **GROUP.GET <group> <key>**: Returns the value of the given key as bulk string. The key is
//!   fetched from its owning peer if required.
//! * **GROUP.FETCH <group> <key>**: Returns the value of the given key without asking any other
//!   peer (see [Group::get_locally](Group::get_locally)). This is the endpoint used by the
//!   [RespPeer](crate::peers::RespPeer) of other nodes. While two nodes disagree on the owner of
//!   a key, this stops a request from bouncing back and forth between them.
//! * **GROUP.LIST**: Lists the names of all groups.
//! * **GROUP.STATS [group]**: Reports the metrics of all groups or a single group.
//!
//! # Example
//!
//! ```
//! # use fleetcache::builder::Builder;
//! # use fleetcache::commands::CommandDictionary;
//! # use fleetcache::group::loader_fn;
//! # use fleetcache::groups::Groups;
//! # use fleetcache::request::Request;
//! # #[tokio::main]
//! # async fn main() {
//! let platform = Builder::new().enable_commands().enable_groups().build().await;
//! let _ = platform.require::<Groups>().create(
//!     "scores",
//!     loader_fn(|key: String| async move { Ok(key.to_uppercase().into_bytes()) }),
//! );
//!
//! let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();
//! let result = dispatcher
//!     .invoke(Request::example(vec!["GROUP.GET", "scores", "tom"]), None)
//!     .await
//!     .unwrap();
//! assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "$3\r\nTOM\r\n");
//! # }
//! ```
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use yaml_rust::Yaml;

use crate::commands::{queue, Call, CommandDictionary, CommandResult, Queue, ResultExt};
use crate::config::{as_string, wait_for_change, Config};
use crate::fmt::{format_duration, format_size, parse_duration, parse_size};
use crate::group::{CacheError, Group, GroupSettings, Loader};
use crate::peers::PeerPool;
use crate::platform::Platform;
use crate::response::SEPARATOR;

/// Keeps all groups of a node by their name.
pub struct Groups {
    platform: Arc<Platform>,
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

#[derive(FromPrimitive)]
enum Commands {
    Get,
    Fetch,
    List,
    Stats,
}

impl Groups {
    /// Creates and installs the registry into the given platform.
    ///
    /// This also registers the **GROUP.*** commands (if a
    /// [CommandDictionary](crate::commands::CommandDictionary) is present) and starts to listen
    /// for config changes.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let groups = Arc::new(Groups {
            platform: platform.clone(),
            groups: RwLock::new(HashMap::new()),
        });
        platform.register::<Groups>(groups.clone());

        let queue = actor(platform.clone(), groups.clone());
        if let Some(commands) = platform.find::<CommandDictionary>() {
            commands.register_command("GROUP.GET", queue.clone(), Commands::Get as usize);
            commands.register_command("GROUP.FETCH", queue.clone(), Commands::Fetch as usize);
            commands.register_command("GROUP.LIST", queue.clone(), Commands::List as usize);
            commands.register_command("GROUP.STATS", queue, Commands::Stats as usize);
        }

        groups
    }

    /// Creates a new group with default settings and registers it.
    ///
    /// See [create_with](Groups::create_with).
    pub fn create(&self, name: &str, loader: Arc<dyn Loader>) -> Arc<Group> {
        self.create_with(name, GroupSettings::default(), loader)
    }

    /// Creates a new group and registers it.
    ///
    /// The given settings are overwritten by the ones present in the config. If a group with the
    /// given name already exists, an error is logged and the existing group is returned.
    pub fn create_with(
        &self,
        name: &str,
        settings: GroupSettings,
        loader: Arc<dyn Loader>,
    ) -> Arc<Group> {
        let mut groups = self.groups.write().unwrap();
        if let Some(group) = groups.get(name) {
            log::error!(
                "A group named {} already exists. Not going to create another one.",
                name
            );
            return group.clone();
        }

        let group = Arc::new(Group::new(name, settings, loader));
        if let Some(config) = self.platform.find::<Config>() {
            apply_settings(&group, &config.current().root()["groups"][name]);
        }
        if let Some(peers) = self.platform.find::<PeerPool>() {
            group.register_peers(peers);
        }

        log::debug!("Created group {}.", name);
        let _ = groups.insert(name.to_owned(), group.clone());

        group
    }

    /// Returns the group with the given name.
    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().unwrap().get(name).cloned()
    }

    /// Returns the names of all groups in alphabetical order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().unwrap().keys().cloned().collect();
        names.sort();

        names
    }

    fn all(&self) -> Vec<Arc<Group>> {
        let mut groups: Vec<Arc<Group>> = self.groups.read().unwrap().values().cloned().collect();
        groups.sort_by(|a, b| a.name().cmp(b.name()));

        groups
    }

    fn apply_config(&self, config: &Config) {
        let handle = config.current();
        for group in self.all() {
            apply_settings(&group, &handle.root()["groups"][group.name()]);
        }
    }
}

/// Applies the settings present in the given config object to the group.
///
/// Absent settings are left as they are. A timeout of 0 disables the timeout.
fn apply_settings(group: &Group, settings: &Yaml) {
    if let Some(max_memory) = as_string(&settings["max_memory"]) {
        match parse_size(&max_memory) {
            Ok(max_memory) => group.set_max_memory(max_memory),
            Err(error) => log::error!(
                "Invalid max_memory for group {}: {:#}",
                group.name(),
                error
            ),
        }
    }

    if let Some(timeout) = as_string(&settings["timeout"]) {
        match parse_duration(&timeout) {
            Ok(timeout) if timeout.is_zero() => group.set_timeout(None),
            Ok(timeout) => group.set_timeout(Some(timeout)),
            Err(error) => log::error!("Invalid timeout for group {}: {:#}", group.name(), error),
        }
    }
}

fn actor(platform: Arc<Platform>, groups: Arc<Groups>) -> Queue {
    let (queue, mut endpoint) = queue();
    let mut config_changed = platform.find::<Config>().map(|config| config.notifier());

    crate::spawn!(async move {
        let mut serving = true;

        while platform.is_running() && (serving || config_changed.is_some()) {
            tokio::select! {
                _ = wait_for_change(&mut config_changed) => {
                    if let Some(config) = platform.find::<Config>() {
                        groups.apply_config(&config);
                    }
                }
                msg = endpoint.recv(), if serving => match msg {
                    Some(mut call) => match Commands::from_usize(call.token) {
                        Some(Commands::Get) => {
                            // A load might take a while, therefore we don't block the actor...
                            let groups = groups.clone();
                            crate::spawn!(async move {
                                get_command(&mut call, &groups, false).await.complete(call);
                            });
                        }
                        Some(Commands::Fetch) => {
                            let groups = groups.clone();
                            crate::spawn!(async move {
                                get_command(&mut call, &groups, true).await.complete(call);
                            });
                        }
                        Some(Commands::List) => list_command(&mut call, &groups).complete(call),
                        Some(Commands::Stats) => stats_command(&mut call, &groups).complete(call),
                        None => call.handle_unknown_token(),
                    },
                    // No commands are installed, but we still listen for config changes...
                    None => serving = false,
                }
            }
        }
    });

    queue
}

fn find_group(groups: &Groups, name: &str) -> Result<Arc<Group>, crate::commands::CommandError> {
    groups
        .get(name)
        .ok_or_else(|| crate::client_error!("Unknown group: {}", name))
}

async fn get_command(call: &mut Call, groups: &Groups, locally: bool) -> CommandResult {
    let group = find_group(groups, call.request.str_parameter(0)?)?;
    let key = call.request.str_parameter(1)?;

    let result = if locally {
        group.get_locally(key).await
    } else {
        group.get(key).await
    };
    match result {
        Ok(value) => {
            call.response.bulk_bytes(value.as_bytes())?;
            Ok(())
        }
        Err(CacheError::EmptyKey) => Err(crate::client_error!("{}", CacheError::EmptyKey)),
        Err(error) => Err(crate::server_error!("{}", error)),
    }
}

fn list_command(call: &mut Call, groups: &Groups) -> CommandResult {
    let names = groups.names();
    call.response.array(names.len() as i32)?;
    for name in names {
        call.response.bulk(name)?;
    }

    Ok(())
}

fn stats_command(call: &mut Call, groups: &Groups) -> CommandResult {
    if call.request.parameter_count() == 0 {
        all_stats_command(call, groups)
    } else {
        group_stats_command(call, groups)
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.
    } else {
        part as f64 * 100. / total as f64
    }
}

fn all_stats_command(call: &mut Call, groups: &Groups) -> CommandResult {
    let mut result = "Use 'GROUP.STATS <group>' for detailed metrics.\n\n".to_owned();
    result += &format!(
        "{:<30} {:>12} {:>12} {:>12} {:>10}\n",
        "Name", "Entries", "Memory", "Gets", "Hit Rate"
    );
    result += SEPARATOR;
    for group in groups.all() {
        let stats = group.stats();
        result += &format!(
            "{:<30} {:>12} {:>12} {:>12} {:>8.2} %\n",
            group.name(),
            stats.cache.entries,
            format_size(stats.cache.allocated_memory),
            stats.gets,
            percent(stats.cache_hits, stats.gets)
        );
    }
    result += SEPARATOR;

    call.response.bulk(result)?;
    Ok(())
}

fn group_stats_command(call: &mut Call, groups: &Groups) -> CommandResult {
    let group = find_group(groups, call.request.str_parameter(0)?)?;
    let stats = group.stats();

    let mut result = String::new();
    result += &format!("{:<30} {:>20}\n", "Entries", stats.cache.entries);
    result += &format!(
        "{:<30} {:>20}\n",
        "Allocated Memory",
        format_size(stats.cache.allocated_memory)
    );
    result += &format!(
        "{:<30} {:>20}\n",
        "Max Memory",
        if stats.cache.max_memory == 0 {
            "unbounded".to_owned()
        } else {
            format_size(stats.cache.max_memory)
        }
    );
    result += &format!(
        "{:<30} {:>20}\n",
        "Timeout",
        group
            .timeout()
            .map(format_duration)
            .unwrap_or_else(|| "none".to_owned())
    );
    result += SEPARATOR;
    result += &format!("{:<30} {:>20}\n", "Gets", stats.gets);
    result += &format!("{:<30} {:>20}\n", "Cache Hits", stats.cache_hits);
    result += &format!(
        "{:<30} {:>18.2} %\n",
        "Hit Rate",
        percent(stats.cache_hits, stats.gets)
    );
    result += &format!("{:<30} {:>20}\n", "Loads", stats.loads);
    result += &format!("{:<30} {:>20}\n", "Deduplicated Loads", stats.loads_deduped);
    result += &format!("{:<30} {:>20}\n", "Peer Loads", stats.peer_loads);
    result += &format!("{:<30} {:>20}\n", "Peer Errors", stats.peer_errors);
    result += &format!("{:<30} {:>20}\n", "Local Loads", stats.local_loads);
    result += &format!("{:<30} {:>20}\n", "Local Load Errors", stats.local_load_errors);
    result += &format!(
        "{:<30} {:>20}\n",
        "Avg. Load Duration",
        stats.load_duration.to_string()
    );
    result += SEPARATOR;
    result += &format!("{:<30} {:>20}\n", "Cache Reads", stats.cache.reads);
    result += &format!("{:<30} {:>20}\n", "Cache Writes", stats.cache.writes);
    result += &format!("{:<30} {:>20}\n", "Evictions", stats.cache.evictions);
    result += &format!(
        "{:<30} {:>18.2} %\n",
        "Cache Hit Rate",
        percent(stats.cache.hits as u64, stats.cache.reads as u64)
    );

    call.response.bulk(result)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::commands::CommandDictionary;
    use crate::config::Config;
    use crate::group::{loader_fn, GroupSettings};
    use crate::groups::Groups;
    use crate::request::Request;
    use crate::testing::test_async;
    use std::sync::Arc;
    use std::time::Duration;

    fn score(key: &str) -> anyhow::Result<Vec<u8>> {
        match key {
            "Tom" => Ok(b"630".to_vec()),
            "Jack" => Ok(b"589".to_vec()),
            "Sam" => Ok(b"567".to_vec()),
            _ => Err(anyhow::anyhow!("{} not exist", key)),
        }
    }

    async fn query(dispatcher: &mut crate::commands::Dispatcher, args: Vec<&str>) -> String {
        let result = dispatcher
            .invoke(Request::example(args), None)
            .await
            .unwrap();
        String::from_utf8_lossy(&result[..]).to_string()
    }

    #[test]
    fn groups_are_served_via_commands() {
        test_async(async {
            let platform = Builder::new()
                .enable_commands()
                .enable_groups()
                .build()
                .await;
            let groups = platform.require::<Groups>();
            let _ = groups.create("scores", loader_fn(|key: String| async move { score(&key) }));
            let _ = groups.create("echo", loader_fn(|key: String| async move { Ok(key.into_bytes()) }));

            let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();
            assert_eq!(
                query(&mut dispatcher, vec!["GROUP.GET", "scores", "Tom"]).await,
                "$3\r\n630\r\n"
            );
            assert_eq!(
                query(&mut dispatcher, vec!["GROUP.GET", "scores", "unknown"]).await,
                "-SERVER: Failed to load the value: unknown not exist\r\n"
            );
            assert_eq!(
                query(&mut dispatcher, vec!["GROUP.GET", "scores", ""]).await,
                "-CLIENT: A key is required\r\n"
            );
            assert_eq!(
                query(&mut dispatcher, vec!["GROUP.FETCH", "scores", "Jack"]).await,
                "$3\r\n589\r\n"
            );
            assert_eq!(
                query(&mut dispatcher, vec!["GROUP.FETCH", "scores", ""]).await,
                "-CLIENT: A key is required\r\n"
            );
            assert_eq!(
                query(&mut dispatcher, vec!["GROUP.GET", "missing", "Tom"]).await,
                "-CLIENT: Unknown group: missing\r\n"
            );
            assert_eq!(
                query(&mut dispatcher, vec!["GROUP.GET", "scores"])
                    .await
                    .starts_with("-CLIENT: "),
                true
            );
            assert_eq!(
                query(&mut dispatcher, vec!["GROUP.LIST"]).await,
                "*2\r\n$4\r\necho\r\n$6\r\nscores\r\n"
            );

            let stats = query(&mut dispatcher, vec!["GROUP.STATS"]).await;
            assert_eq!(stats.contains("scores"), true);
            let stats = query(&mut dispatcher, vec!["GROUP.STATS", "scores"]).await;
            assert_eq!(stats.contains("Local Load Errors"), true);

            platform.terminate();
        });
    }

    #[test]
    fn duplicate_groups_are_rejected() {
        test_async(async {
            let platform = Builder::new().enable_groups().build().await;
            let groups = platform.require::<Groups>();

            let first = groups.create("scores", loader_fn(|key: String| async move { score(&key) }));
            let second = groups.create("scores", loader_fn(|_: String| async move { Ok(Vec::new()) }));

            assert_eq!(Arc::ptr_eq(&first, &second), true);
            assert_eq!(groups.names(), vec!["scores".to_owned()]);
            assert_eq!(groups.get("scores").is_some(), true);
            assert_eq!(groups.get("unknown").is_none(), true);
        });
    }

    #[test]
    fn settings_are_read_from_the_config() {
        test_async(async {
            let platform = Builder::new().enable_config().enable_groups().build().await;
            let config = platform.require::<Config>();
            config
                .load_from_string(
                    "
                groups:
                    scores:
                        max_memory: 1k
                        timeout: 2s
                ",
                    None,
                )
                .unwrap();

            let group = platform.require::<Groups>().create_with(
                "scores",
                GroupSettings {
                    max_memory: 64,
                    ..GroupSettings::default()
                },
                loader_fn(|key: String| async move { score(&key) }),
            );
            assert_eq!(group.stats().cache.max_memory, 1024);
            assert_eq!(group.timeout(), Some(Duration::from_secs(2)));

            // Changes are picked up by the actor of the registry...
            config
                .load_from_string(
                    "
                groups:
                    scores:
                        max_memory: 2k
                        timeout: 0
                ",
                    None,
                )
                .unwrap();
            for _ in 0..100 {
                if group.stats().cache.max_memory == 2048 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(group.stats().cache.max_memory, 2048);
            assert_eq!(group.timeout(), None);

            platform.terminate();
        });
    }

    #[test]
    fn invalid_settings_are_skipped() {
        test_async(async {
            let platform = Builder::new().enable_config().enable_groups().build().await;
            platform
                .require::<Config>()
                .load_from_string(
                    "
                groups:
                    scores:
                        max_memory: 1k
                        timeout: 999999999999999999d
                ",
                    None,
                )
                .unwrap();

            let groups = platform.require::<Groups>();
            let group = groups.create_with(
                "scores",
                GroupSettings {
                    timeout: Some(Duration::from_secs(3)),
                    ..GroupSettings::default()
                },
                loader_fn(|key: String| async move { score(&key) }),
            );

            assert_eq!(group.stats().cache.max_memory, 1024);
            assert_eq!(group.timeout(), Some(Duration::from_secs(3)));
            // The registry is still usable...
            assert_eq!(groups.names(), vec!["scores".to_owned()]);
            assert_eq!(group.get("Tom").await.unwrap().to_string(), "630");

            platform.terminate();
        });
    }
}
