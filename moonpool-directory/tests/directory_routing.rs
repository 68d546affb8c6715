//! Registration, lookup and routing across the nodes of one cluster.

mod common;

use std::time::Duration;

use common::{grain, init_tracing, local_status, settle, TestCluster};
use moonpool_directory::{
    ActivationAddress, ActivationId, ActivationStatus, ClusterId, DirectoryConfig, DirectoryError,
    GrainId, GrainType, NodeStatus,
};

fn config() -> DirectoryConfig {
    DirectoryConfig::builder()
        .retry_delay(Duration::from_millis(10))
        .build()
        .expect("valid config")
}

#[tokio::test(start_paused = true)]
async fn test_single_activation_first_writer_wins() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 11000, 3, config());
            let g = grain("alice");
            let first = cluster.activation(&g, 0, 1);
            let second = cluster.activation(&g, 1, 2);

            let winner = cluster.nodes[0]
                .register_single_activation(first.clone())
                .await
                .expect("registered");
            assert_eq!(winner, first);

            let winner = cluster.nodes[2]
                .register_single_activation(second)
                .await
                .expect("registered");
            assert_eq!(winner, first, "the second registration loses");

            let owner = cluster.owner_of(&g);
            assert_eq!(
                local_status(owner, &g, ActivationId(1)),
                Some(ActivationStatus::Owned)
            );
            for directory in &cluster.nodes {
                let found = directory.lookup(&g).await.expect("lookup");
                assert_eq!(found, vec![first.clone()], "lookup from {}", directory.me());
            }
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_multi_activation_registration_keeps_every_instance() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 11100, 3, config());
            let g = grain("stateless-worker");
            for (host, id) in [(0, 1), (1, 2), (2, 3)] {
                let address = cluster.activation(&g, host, id);
                let registered = cluster.nodes[host]
                    .register(address.clone())
                    .await
                    .expect("registered");
                assert_eq!(registered, address);
            }
            let found = cluster.nodes[1].lookup(&g).await.expect("lookup");
            assert_eq!(found.len(), 3);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_lookup_fills_cache_and_unregister_invalidates_it() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 11200, 3, config());
            let g = grain("bob");
            let caller = cluster.non_owner_of(&g).clone();
            let address = cluster.activation(&g, 0, 5);
            caller
                .register_single_activation(address.clone())
                .await
                .expect("registered");

            assert_eq!(caller.local_lookup(&g).expect("routable"), None);
            let result = caller.full_lookup(&g).await.expect("owner answers");
            assert_eq!(result.activations, vec![address.clone()]);
            assert!(result.version_tag.is_some());
            assert_eq!(
                caller.local_lookup(&g).expect("routable"),
                Some(vec![address.clone()])
            );

            caller
                .unregister(address, true)
                .await
                .expect("unregistered");
            assert_eq!(caller.local_lookup(&g).expect("routable"), None);
            assert!(caller.lookup(&g).await.expect("lookup").is_empty());
            assert!(cluster.owner_of(&g).get_local_data_for_grain(&g).is_none());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_owner_answers_lookups_authoritatively() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 11300, 2, config());
            let g = grain("unknown");
            let owner = cluster.owner_of(&g);
            assert_eq!(owner.local_lookup(&g).expect("routable"), Some(Vec::new()));
            let result = owner.full_lookup(&g).await.expect("local answer");
            assert!(result.activations.is_empty());
            assert_eq!(result.version_tag, None);
            assert_eq!(owner.cache_len(), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_misrouted_request_forwards_or_fails_without_retries() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 11400, 3, config());
            let g = grain("misrouted");
            let wrong = cluster.non_owner_of(&g);
            let owner = cluster.owner_of(&g).me().clone();

            let error = wrong
                .peer()
                .lookup(g.clone(), 0)
                .await
                .expect_err("no retries left");
            match error {
                DirectoryError::NotOwner {
                    grain: failed,
                    owner: computed,
                    node,
                } => {
                    assert_eq!(failed, g);
                    assert_eq!(computed, owner);
                    assert_eq!(&node, wrong.me());
                }
                other => panic!("unexpected error {other:?}"),
            }

            let address = cluster.activation(&g, 0, 9);
            let registered = wrong
                .peer()
                .register_single_activation(address.clone(), 1)
                .await
                .expect("forwarded to the owner");
            assert_eq!(registered, address);
            assert!(cluster.owner_of(&g).get_local_data_for_grain(&g).is_some());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_unregister_many_and_delete_grain() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 11500, 3, config());
            let addresses: Vec<_> = (0..20u64)
                .map(|i| cluster.activation(&grain(&format!("g{i}")), (i % 3) as usize, i))
                .collect();
            for address in &addresses {
                cluster.nodes[0]
                    .register_single_activation(address.clone())
                    .await
                    .expect("registered");
            }
            let total: usize = cluster.nodes.iter().map(|d| d.partition_len()).sum();
            assert_eq!(total, 20);

            cluster.nodes[1]
                .unregister_many(addresses[..10].to_vec())
                .await
                .expect("unregistered");
            let total: usize = cluster.nodes.iter().map(|d| d.partition_len()).sum();
            assert_eq!(total, 10);

            let doomed = addresses[15].grain.clone();
            cluster.nodes[2]
                .delete_grain(doomed.clone())
                .await
                .expect("deleted");
            assert!(cluster.nodes[0]
                .lookup(&doomed)
                .await
                .expect("lookup")
                .is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_unregister_many_keeps_going_past_unroutable_addresses() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 11550, 3, config());
            let addresses: Vec<_> = (0..9u64)
                .map(|i| cluster.activation(&grain(&format!("u{i}")), (i % 3) as usize, i))
                .collect();
            for address in &addresses {
                cluster.nodes[0]
                    .register_single_activation(address.clone())
                    .await
                    .expect("registered");
            }

            // no seed is configured, so a well-known grain has no owner
            let orphan = ActivationAddress::new(
                GrainId::well_known(GrainType(7), "registry"),
                cluster.nodes[0].me().clone(),
                ActivationId(99),
            );
            let mut batch = addresses[..4].to_vec();
            batch.push(orphan.clone());
            batch.extend_from_slice(&addresses[4..]);

            let result = cluster.nodes[1].unregister_many(batch).await;
            assert_eq!(
                result,
                Err(DirectoryError::MissingSeed {
                    grain: orphan.grain
                })
            );
            let total: usize = cluster.nodes.iter().map(|d| d.partition_len()).sum();
            assert_eq!(
                total, 0,
                "routable addresses after the failure are still removed"
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_lazy_unregistration_only_removes_fresh_activations() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let config = DirectoryConfig::builder()
                .lazy_deregistration_delay(Duration::from_secs(60))
                .build()
                .expect("valid config");
            let cluster = TestCluster::start(ClusterId(0), 11600, 2, config);
            let young = cluster.activation(&grain("young"), 0, 1);
            let old = cluster.activation(&grain("old"), 0, 2);
            cluster.nodes[0]
                .register_single_activation(old.clone())
                .await
                .expect("registered");
            tokio::time::sleep(Duration::from_secs(120)).await;
            cluster.nodes[0]
                .register_single_activation(young.clone())
                .await
                .expect("registered");

            cluster.nodes[1]
                .unregister_conditionally(young.clone())
                .await
                .expect("unregistered");
            cluster.nodes[1]
                .unregister_conditionally(old.clone())
                .await
                .expect("unregistered");

            assert!(cluster.nodes[0]
                .lookup(&young.grain)
                .await
                .expect("lookup")
                .is_empty());
            assert_eq!(
                cluster.nodes[0].lookup(&old.grain).await.expect("lookup"),
                vec![old.clone()]
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_leave_hands_off_range() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 11700, 3, config());
            let addresses: Vec<_> = (0..30u64)
                .map(|i| cluster.activation(&grain(&format!("k{i}")), 0, i))
                .collect();
            for address in &addresses {
                cluster.nodes[0]
                    .register_single_activation(address.clone())
                    .await
                    .expect("registered");
            }

            let leaving = cluster.nodes[2].me().clone();
            cluster
                .membership
                .set_status(leaving.clone(), NodeStatus::ShuttingDown);
            settle().await;
            assert!(!cluster.nodes[2].is_running());
            for directory in &cluster.nodes[..2] {
                assert!(!directory.ring_members().contains(&leaving));
            }
            for address in &addresses {
                let found = cluster.nodes[1]
                    .lookup(&address.grain)
                    .await
                    .expect("lookup");
                assert_eq!(found, vec![address.clone()]);
            }
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_joining_node_takes_over_its_range() {
    init_tracing();
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut cluster = TestCluster::start(ClusterId(0), 11750, 2, config());
            let addresses: Vec<_> = (0..40u64)
                .map(|i| cluster.activation(&grain(&format!("j{i}")), 1, i))
                .collect();
            for address in &addresses {
                cluster.nodes[0]
                    .register_single_activation(address.clone())
                    .await
                    .expect("registered");
            }

            let joined = cluster.join(11760, config());
            settle().await;
            assert_eq!(joined.ring_members().len(), 3);

            let total: usize = cluster.nodes.iter().map(|d| d.partition_len()).sum();
            assert_eq!(total, 40, "every grain lives in exactly one partition");
            for address in &addresses {
                let owner = cluster.owner_of(&address.grain);
                assert_eq!(
                    local_status(owner, &address.grain, address.activation),
                    Some(ActivationStatus::Owned),
                    "{} held by its owner {}",
                    address.grain,
                    owner.me()
                );
                let found = joined.lookup(&address.grain).await.expect("lookup");
                assert_eq!(found, vec![address.clone()]);
            }
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_stopped_directory_refuses_ownership() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let cluster = TestCluster::start(ClusterId(0), 11800, 1, config());
            let directory = &cluster.nodes[0];
            directory.stop(false).await.expect("stopped");
            directory.stop_preparation_completed().await;
            let error = directory
                .register_single_activation(cluster.activation(&grain("late"), 0, 1))
                .await
                .expect_err("stopping");
            assert_eq!(error, DirectoryError::Stopping);
        })
        .await;
}
