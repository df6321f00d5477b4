//! Provides a consistent hash ring which maps keys onto peers.
//!
//! Each peer is placed on the ring multiple times (as **virtual nodes**, see
//! [DEFAULT_REPLICAS](DEFAULT_REPLICAS)) so that keys spread evenly even for small clusters.
//! A key is owned by the first virtual node whose hash is greater than or equal to the hash of
//! the key. If there is no such node, the ring wraps around to the first one.
//!
//! As the ring only depends on the set of peers and the hash function, all nodes of a cluster
//! which are configured alike agree on the owner of each key. Adding a peer only moves keys
//! onto the new peer, all other keys stay where they are.
//!
//! # Example
//!
//! ```
//! # use fleetcache::hashring::HashRing;
//! let mut ring = HashRing::new(50);
//! ring.add(&["10.0.0.1:2410", "10.0.0.2:2410"]);
//!
//! let owner = ring.get("Tom").unwrap();
//! assert_eq!(ring.get("Tom").unwrap(), owner);
//! ```
use fnv::FnvHashMap;

/// Represents the hash function used to place keys and virtual nodes on the ring.
pub type Hash = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Determines the number of virtual nodes per peer used by the peer pool.
pub const DEFAULT_REPLICAS: usize = 50;

/// Computes the default hash (xxHash32 with a seed of 0) of the given data.
pub fn default_hash(data: &[u8]) -> u32 {
    xxhash_rust::xxh32::xxh32(data, 0)
}

/// Maps keys onto a set of peer names.
pub struct HashRing {
    replicas: usize,
    hash: Hash,
    keys: Vec<u32>,
    owners: FnvHashMap<u32, String>,
    members: Vec<String>,
}

impl HashRing {
    /// Creates an empty ring which places each peer **replicas** times using the
    /// [default_hash](default_hash).
    pub fn new(replicas: usize) -> Self {
        HashRing::with_hash(replicas, Box::new(default_hash))
    }

    /// Creates an empty ring which uses the given hash function.
    ///
    /// # Examples
    /// ```
    /// # use fleetcache::hashring::HashRing;
    /// // A hash which simply parses the decimal input makes the ring predictable...
    /// let mut ring = HashRing::with_hash(3, Box::new(|data: &[u8]| {
    ///     std::str::from_utf8(data).unwrap().parse::<u32>().unwrap()
    /// }));
    ///
    /// // ...which places "2" at 2, 12 and 22...
    /// ring.add(&["2"]);
    /// assert_eq!(ring.get("13").unwrap(), "2");
    /// ```
    pub fn with_hash(replicas: usize, hash: Hash) -> Self {
        HashRing {
            replicas,
            hash,
            keys: Vec::new(),
            owners: FnvHashMap::default(),
            members: Vec::new(),
        }
    }

    /// Places the given peers onto the ring.
    ///
    /// Virtual node **i** of a peer is placed at the hash of the decimal number **i** followed
    /// by the peer name. If two virtual nodes collide, the one added last wins.
    pub fn add<S: AsRef<str>>(&mut self, peers: &[S]) {
        for peer in peers {
            let peer = peer.as_ref();
            for i in 0..self.replicas {
                let hash = (self.hash)(format!("{}{}", i, peer).as_bytes());
                if self.owners.insert(hash, peer.to_owned()).is_none() {
                    self.keys.push(hash);
                }
            }
            self.members.push(peer.to_owned());
        }

        self.keys.sort_unstable();
    }

    /// Returns the peer which owns the given key or **None** if the ring is empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let index = self.keys.partition_point(|node| *node < hash) % self.keys.len();

        self.owners.get(&self.keys[index]).map(|owner| owner.as_str())
    }

    /// Determines if no peer has been added yet.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the names of all peers in the order they were added.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Returns the number of virtual nodes per peer.
    pub fn replicas(&self) -> usize {
        self.replicas
    }
}
