use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetcache::builder::Builder;
use fleetcache::group::loader_fn;
use fleetcache::groups::Groups;
use fleetcache::server::Server;

#[tokio::main]
async fn main() {
    // Build a platform and enable all features...
    let platform = Builder::new().enable_all().build().await;

    // Register a demo group which is backed by a slow "database"...
    let scores: Arc<HashMap<&'static str, &'static str>> =
        Arc::new([("Tom", "630"), ("Jack", "589"), ("Sam", "567")].into_iter().collect());
    let _ = platform.require::<Groups>().create(
        "scores",
        loader_fn(move |key: String| {
            let scores = scores.clone();
            async move {
                log::info!("[SlowDB] search key {}", key);
                tokio::time::sleep(Duration::from_millis(100)).await;

                scores
                    .get(key.as_str())
                    .map(|score| score.as_bytes().to_vec())
                    .ok_or_else(|| anyhow::anyhow!("{} not exist", key))
            }
        }),
    );

    platform.require::<Server>().event_loop().await;
}
