//! Determines which node of the fleet owns a key.
//!
//! The [PeerPool](PeerPool) places all members of the fleet on a [HashRing](HashRing) and keeps a
//! [RespPeer](RespPeer) per remote member. It is the [PeerPicker](PeerPicker) used by all groups
//! created via the [Groups](crate::groups::Groups) registry.
//!
//! The members are read from the config:
//!
//! ```yaml
//! peers:
//!     # The address under which this node is listed in members.
//!     self: "10.0.0.1:2410"
//!     # The number of virtual nodes per member.
//!     replicas: 50
//!     members:
//!         - "10.0.0.1:2410"
//!         - "10.0.0.2:2410"
//!         - "10.0.0.3:2410"
//! ```
//!
//! Every change of the config rebuilds the ring. All members therefore have to use the same list
//! (and number of replicas) to agree on the owner of a key. The request path only reads an
//! immutable snapshot and never blocks on a rebuild.
//!
//! Provides the commands:
//! * **PEER.LIST**: Lists all members of the ring.
//! * **PEER.OWNER <key>**: Returns the address of the member owning the given key (or nil if the
//!   ring is empty).
use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::commands::{queue, Call, CommandDictionary, CommandResult, Queue, ResultExt};
use crate::config::{wait_for_change, Config, Handle};
use crate::group::{PeerFetcher, PeerPicker};
use crate::hashring::{HashRing, DEFAULT_REPLICAS};
use crate::platform::Platform;
use crate::response::SEPARATOR;

pub mod client;

pub use client::RespPeer;

/// Represents an immutable snapshot of the fleet.
struct Members {
    me: String,
    ring: HashRing,
    fetchers: HashMap<String, Arc<RespPeer>>,
}

/// Locates the owner of a key among the members of the fleet.
///
/// # Example
///
/// ```
/// # use fleetcache::peers::PeerPool;
/// # use fleetcache::group::PeerPicker;
/// let pool = PeerPool::new("10.0.0.1:2410");
/// pool.set_peers(50, &["10.0.0.1:2410", "10.0.0.2:2410"]);
///
/// let owner = pool.owner("Tom").unwrap();
/// match pool.pick_peer("Tom") {
///     Some(peer) => assert_eq!(peer.to_string(), owner),
///     None => assert_eq!(owner, "10.0.0.1:2410"),
/// }
/// ```
pub struct PeerPool {
    members: ArcSwap<Members>,
}

#[derive(FromPrimitive)]
enum Commands {
    List,
    Owner,
}

impl PeerPool {
    /// Creates an empty pool for the node listed as **me**.
    ///
    /// As long as no peers are set, every key is owned locally.
    pub fn new(me: impl Into<String>) -> Self {
        PeerPool {
            members: ArcSwap::new(Arc::new(Members {
                me: me.into(),
                ring: HashRing::new(DEFAULT_REPLICAS),
                fetchers: HashMap::new(),
            })),
        }
    }

    /// Creates a pool based on the **peers** section of the config and installs it.
    ///
    /// The pool is rebuilt on every config change. Also registers the **PEER.*** commands if a
    /// [CommandDictionary](crate::commands::CommandDictionary) is present.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let pool = Arc::new(PeerPool::new(""));
        let config = platform.find::<Config>();
        if let Some(config) = &config {
            pool.apply_config(&config.current());
        }
        platform.register::<PeerPool>(pool.clone());

        let queue = actor(platform.clone(), pool.clone());
        if let Some(commands) = platform.find::<CommandDictionary>() {
            commands.register_command("PEER.LIST", queue.clone(), Commands::List as usize);
            commands.register_command("PEER.OWNER", queue, Commands::Owner as usize);
        }

        pool
    }

    /// Replaces the members of the ring.
    ///
    /// The given list should contain the address of this node. A [RespPeer](RespPeer) of a member
    /// which is still present is kept along with its pooled connections.
    pub fn set_peers<S: AsRef<str>>(&self, replicas: usize, peers: &[S]) {
        let me = self.me();
        self.rebuild(me, replicas, peers);
    }

    fn rebuild<S: AsRef<str>>(&self, me: String, replicas: usize, peers: &[S]) {
        let current = self.members.load();

        let mut ring = HashRing::new(replicas.max(1));
        ring.add(peers);

        let fetchers = peers
            .iter()
            .map(|peer| peer.as_ref())
            .filter(|peer| *peer != me)
            .map(|peer| {
                let fetcher = current
                    .fetchers
                    .get(peer)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(RespPeer::new(peer)));
                (peer.to_owned(), fetcher)
            })
            .collect();

        if !me.is_empty() && !peers.is_empty() && !peers.iter().any(|peer| peer.as_ref() == me) {
            log::warn!(
                "This node ({}) is not listed as peer. It will not own any keys.",
                me
            );
        }
        log::info!(
            "Updated the peer ring: {} member(s) with {} replica(s) each.",
            peers.len(),
            ring.replicas()
        );

        self.members.store(Arc::new(Members { me, ring, fetchers }));
    }

    fn apply_config(&self, handle: &Handle) {
        let me = handle
            .query("peers.self")
            .as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| self.me());
        let replicas = handle
            .query("peers.replicas")
            .as_i64()
            .filter(|replicas| *replicas > 0)
            .map(|replicas| replicas as usize)
            .unwrap_or(DEFAULT_REPLICAS);
        let peers: Vec<String> = handle
            .query("peers.members")
            .as_vec()
            .map(|members| {
                members
                    .iter()
                    .filter_map(|member| member.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();

        self.rebuild(me, replicas, &peers);
    }

    /// Returns the address of this node.
    pub fn me(&self) -> String {
        self.members.load().me.clone()
    }

    /// Returns the member which owns the given key, or **None** if the ring is empty.
    pub fn owner(&self, key: &str) -> Option<String> {
        self.members.load().ring.get(key).map(str::to_owned)
    }

    /// Returns all members of the ring.
    pub fn members(&self) -> Vec<String> {
        self.members.load().ring.members().to_vec()
    }
}

impl PeerPicker for PeerPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerFetcher>> {
        let members = self.members.load();
        let owner = members.ring.get(key)?;
        if owner == members.me {
            return None;
        }

        log::debug!("Picked peer {} for {}", owner, key);
        let fetcher: Arc<dyn PeerFetcher> = members.fetchers.get(owner)?.clone();

        Some(fetcher)
    }
}

fn actor(platform: Arc<Platform>, pool: Arc<PeerPool>) -> Queue {
    let (queue, mut endpoint) = queue();
    let mut config_changed = platform.find::<Config>().map(|config| config.notifier());

    crate::spawn!(async move {
        let mut serving = true;

        while platform.is_running() && (serving || config_changed.is_some()) {
            tokio::select! {
                _ = wait_for_change(&mut config_changed) => {
                    if let Some(config) = platform.find::<Config>() {
                        pool.apply_config(&config.current());
                    }
                }
                msg = endpoint.recv(), if serving => match msg {
                    Some(mut call) => match Commands::from_usize(call.token) {
                        Some(Commands::List) => list_command(&mut call, &pool).complete(call),
                        Some(Commands::Owner) => owner_command(&mut call, &pool).complete(call),
                        None => call.handle_unknown_token(),
                    },
                    None => serving = false,
                }
            }
        }
    });

    queue
}

fn list_command(call: &mut Call, pool: &PeerPool) -> CommandResult {
    let members = pool.members.load();

    let mut result = format!("{:<30} {:>20}\n", "Self", members.me);
    result += &format!("{:<30} {:>20}\n", "Replicas", members.ring.replicas());
    result += "\n";
    result += &format!("{:<40} {:>10}\n", "Member", "Local");
    result += SEPARATOR;
    for member in members.ring.members() {
        result += &format!(
            "{:<40} {:>10}\n",
            member,
            if *member == members.me { "yes" } else { "" }
        );
    }
    result += SEPARATOR;

    call.response.bulk(result)?;
    Ok(())
}

fn owner_command(call: &mut Call, pool: &PeerPool) -> CommandResult {
    match pool.owner(call.request.str_parameter(0)?) {
        Some(owner) => call.response.bulk(owner)?,
        None => call.response.null()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::commands::CommandDictionary;
    use crate::config::Config;
    use crate::group::{loader_fn, Group, GroupSettings, PeerPicker};
    use crate::groups::Groups;
    use crate::peers::PeerPool;
    use crate::request::Request;
    use crate::server::Server;
    use crate::testing::test_async;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn only_remote_owners_are_picked() {
        let pool = PeerPool::new("a:2410");
        assert_eq!(pool.pick_peer("Tom").is_none(), true);
        assert_eq!(pool.owner("Tom"), None);

        pool.set_peers(10, &["a:2410", "b:2410", "c:2410"]);
        assert_eq!(pool.members().len(), 3);

        let mut local = 0;
        for i in 0..100 {
            let key = format!("key-{}", i);
            let owner = pool.owner(&key).unwrap();
            match pool.pick_peer(&key) {
                Some(peer) => assert_eq!(peer.to_string(), owner),
                None => {
                    assert_eq!(owner, "a:2410");
                    local += 1;
                }
            }
        }
        assert_eq!(local > 0 && local < 100, true);
    }

    #[test]
    fn fetchers_survive_a_rebuild() {
        let pool = PeerPool::new("a:2410");
        pool.set_peers(10, &["a:2410", "b:2410"]);
        let before = pool.members.load().fetchers.get("b:2410").cloned().unwrap();

        pool.set_peers(10, &["a:2410", "b:2410", "c:2410"]);
        let after = pool.members.load().fetchers.get("b:2410").cloned().unwrap();

        assert_eq!(Arc::ptr_eq(&before, &after), true);
        assert_eq!(pool.members.load().fetchers.contains_key("a:2410"), false);
    }

    #[test]
    fn the_ring_follows_the_config() {
        test_async(async {
            let platform = Builder::new()
                .enable_config()
                .enable_commands()
                .enable_peers()
                .build()
                .await;
            let config = platform.require::<Config>();
            config
                .load_from_string(
                    "
                peers:
                    self: a:2410
                    replicas: 5
                    members:
                        - a:2410
                        - b:2410
                ",
                    None,
                )
                .unwrap();

            let pool = platform.require::<PeerPool>();
            for _ in 0..100 {
                if pool.members().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(pool.me(), "a:2410");
            assert_eq!(pool.members.load().ring.replicas(), 5);

            let mut dispatcher = platform.require::<CommandDictionary>().dispatcher();
            let result = dispatcher
                .invoke(Request::example(vec!["PEER.OWNER", "Tom"]), None)
                .await
                .unwrap();
            let owner = pool.owner("Tom").unwrap();
            assert_eq!(
                std::str::from_utf8(&result[..]).unwrap(),
                format!("${}\r\n{}\r\n", owner.len(), owner)
            );

            let result = dispatcher
                .invoke(Request::example(vec!["PEER.LIST"]), None)
                .await
                .unwrap();
            assert_eq!(String::from_utf8_lossy(&result[..]).contains("b:2410"), true);

            platform.terminate();
        });
    }

    #[test]
    fn values_are_loaded_by_their_owner() {
        // We want exclusive access to port 1503 on which we fire up a test-server...
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            // The owning node serves "scores" via its server on port 1503...
            let owner = Builder::new()
                .enable_config()
                .enable_commands()
                .enable_server()
                .enable_groups()
                .build()
                .await;
            owner
                .require::<Config>()
                .load_from_string(
                    "
                server:
                    port: 1503
            ",
                    None,
                )
                .unwrap();
            let owner_loads = Arc::new(AtomicUsize::new(0));
            let counter = owner_loads.clone();
            let _ = owner.require::<Groups>().create(
                "scores",
                loader_fn(move |key: String| {
                    let _ = counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(format!("remote {}", key).into_bytes()) }
                }),
            );
            Server::fork_and_await(&owner.require::<Server>()).await;

            // The asking node only uses a group and a pool...
            let local_loads = Arc::new(AtomicUsize::new(0));
            let counter = local_loads.clone();
            let group = Group::new(
                "scores",
                GroupSettings::default(),
                loader_fn(move |key: String| {
                    let _ = counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(format!("local {}", key).into_bytes()) }
                }),
            );
            let pool = Arc::new(PeerPool::new("local:2410"));
            pool.set_peers(50, &["local:2410", "127.0.0.1:1503"]);
            group.register_peers(pool.clone());

            let remote_key = (0..100)
                .map(|i| format!("key-{}", i))
                .find(|key| pool.owner(key).as_deref() == Some("127.0.0.1:1503"))
                .unwrap();
            let local_key = (0..100)
                .map(|i| format!("key-{}", i))
                .find(|key| pool.owner(key).as_deref() == Some("local:2410"))
                .unwrap();

            assert_eq!(
                group.get(&remote_key).await.unwrap().to_string(),
                format!("remote {}", remote_key)
            );
            assert_eq!(
                group.get(&local_key).await.unwrap().to_string(),
                format!("local {}", local_key)
            );
            assert_eq!(owner_loads.load(Ordering::SeqCst), 1);
            assert_eq!(local_loads.load(Ordering::SeqCst), 1);

            // Once the owner is gone, the local loader steps in...
            owner.terminate();
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let other_remote_key = (100..1000)
                .map(|i| format!("key-{}", i))
                .find(|key| pool.owner(key).as_deref() == Some("127.0.0.1:1503"))
                .unwrap();
            assert_eq!(
                group.get(&other_remote_key).await.unwrap().to_string(),
                format!("local {}", other_remote_key)
            );
            assert_eq!(group.stats().peer_errors, 1);
        });
    }
}
