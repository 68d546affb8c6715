//! Caching of remote entries and their background revalidation.

mod common;

use std::time::Duration;

use common::{grain, settle, TestCluster};
use moonpool_directory::{CacheStrategy, ClusterId, DirectoryConfig, GrainId, NodeStatus};

fn adaptive() -> DirectoryConfig {
    DirectoryConfig::builder()
        .cache_strategy(CacheStrategy::Adaptive)
        .cache_ttl(Duration::from_secs(2), Duration::from_secs(8))
        .cache_refresh_period(Duration::from_secs(600))
        .retry_delay(Duration::from_millis(10))
        .build()
        .expect("valid config")
}

/// `count` grains owned by node `owner` of `cluster`.
fn grains_owned_by(cluster: &TestCluster, owner: usize, count: usize) -> Vec<GrainId> {
    let me = cluster.nodes[owner].me().clone();
    (0..)
        .map(|i| grain(&format!("cached-{i}")))
        .filter(|g| cluster.nodes[0].get_primary_for_grain(g).expect("routable") == me)
        .take(count)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_refresh_keeps_fresh_updates_changed_and_drops_deleted() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 14000, 2, adaptive());
            let owner = cluster.nodes[0].clone();
            let caller = cluster.nodes[1].clone();
            let grains = grains_owned_by(&cluster, 0, 3);
            let (stable, changed, deleted) = (&grains[0], &grains[1], &grains[2]);

            for (i, g) in grains.iter().enumerate() {
                owner
                    .register(cluster.activation(g, 0, i as u64))
                    .await
                    .expect("registered");
                caller.full_lookup(g).await.expect("owner answers");
            }
            assert_eq!(caller.cache_len(), 3);

            owner
                .register(cluster.activation(changed, 1, 10))
                .await
                .expect("registered");
            owner
                .unregister(cluster.activation(deleted, 0, 2), true)
                .await
                .expect("unregistered");

            // nothing has expired yet
            caller.refresh_cache_now().await;
            assert_eq!(
                caller.get_cached_data_for_grain(changed).map(|v| v.len()),
                Some(1)
            );

            tokio::time::sleep(Duration::from_secs(3)).await;
            caller.refresh_cache_now().await;

            assert_eq!(
                caller.get_cached_data_for_grain(stable).map(|v| v.len()),
                Some(1)
            );
            assert_eq!(
                caller.get_cached_data_for_grain(changed).map(|v| v.len()),
                Some(2)
            );
            assert_eq!(caller.get_cached_data_for_grain(deleted), None);
            assert_eq!(caller.cache_len(), 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_background_maintainer_revalidates_expired_entries() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let config = DirectoryConfig::builder()
                .cache_strategy(CacheStrategy::Adaptive)
                .cache_ttl(Duration::from_secs(1), Duration::from_secs(4))
                .cache_refresh_period(Duration::from_secs(2))
                .build()
                .expect("valid config");
            let cluster = TestCluster::start(ClusterId(0), 14100, 2, config);
            let g = grains_owned_by(&cluster, 0, 1).remove(0);
            let address = cluster.activation(&g, 0, 1);
            cluster.nodes[0]
                .register_single_activation(address.clone())
                .await
                .expect("registered");
            cluster.nodes[1]
                .full_lookup(&g)
                .await
                .expect("owner answers");

            cluster.nodes[0]
                .unregister(address, true)
                .await
                .expect("unregistered");
            assert_eq!(cluster.nodes[1].cache_len(), 1, "stale until revalidated");

            tokio::time::sleep(Duration::from_secs(5)).await;
            assert_eq!(cluster.nodes[1].cache_len(), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_dead_node_entries_leave_the_cache() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 14200, 3, adaptive());
            let g = grains_owned_by(&cluster, 0, 1).remove(0);
            let address = cluster.activation(&g, 2, 1);
            cluster.nodes[0]
                .register_single_activation(address.clone())
                .await
                .expect("registered");
            let caller = cluster.nodes[1].clone();
            caller.full_lookup(&g).await.expect("owner answers");
            assert_eq!(
                caller.local_lookup(&g).expect("routable"),
                Some(vec![address])
            );

            cluster
                .membership
                .set_status(cluster.nodes[2].me().clone(), NodeStatus::Dead);
            settle().await;
            assert_eq!(caller.get_cached_data_for_grain(&g), None);
            assert_eq!(caller.local_lookup(&g).expect("routable"), None);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_lru_cache_is_bounded() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let config = DirectoryConfig::builder()
                .cache_strategy(CacheStrategy::Lru)
                .cache_size(2)
                .build()
                .expect("valid config");
            let cluster = TestCluster::start(ClusterId(0), 14300, 2, config);
            let grains = grains_owned_by(&cluster, 0, 3);
            for (i, g) in grains.iter().enumerate() {
                cluster.nodes[0]
                    .register_single_activation(cluster.activation(g, 0, i as u64))
                    .await
                    .expect("registered");
                cluster.nodes[1]
                    .full_lookup(g)
                    .await
                    .expect("owner answers");
            }
            assert_eq!(cluster.nodes[1].cache_len(), 2);
            assert_eq!(cluster.nodes[1].get_cached_data_for_grain(&grains[0]), None);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_cache_never_stores() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let config = DirectoryConfig::builder()
                .cache_strategy(CacheStrategy::None)
                .build()
                .expect("valid config");
            let cluster = TestCluster::start(ClusterId(0), 14400, 2, config);
            let g = grains_owned_by(&cluster, 0, 1).remove(0);
            cluster.nodes[0]
                .register_single_activation(cluster.activation(&g, 0, 1))
                .await
                .expect("registered");
            assert_eq!(cluster.nodes[1].lookup(&g).await.expect("lookup").len(), 1);
            assert_eq!(cluster.nodes[1].cache_len(), 0);
            assert_eq!(cluster.nodes[1].local_lookup(&g).expect("routable"), None);
        })
        .await;
}
