//! Partition replication and handoff on ring changes.
//!
//! Every node mirrors its partition onto its `replication_factor` ring
//! successors, its *followers*. Ownership moves clockwise (a removed node's
//! range goes to its successor), so the first follower of a node is also
//! its heir, and promoting a replica is a local merge.
//!
//! # Rounds
//!
//! [`ReplicationAgent::run`] wakes every `replication_period` and ships
//! changes to each follower:
//!
//! - a **full** round sends every entry; the first chunk replaces the
//!   follower's replica and later chunks are applied as deltas. A round is
//!   full when forced, every `full_replication_cycle` rounds, or for a
//!   follower that has not acknowledged anything yet (new follower, or a
//!   failed previous round).
//! - a **delta** round sends the entries whose version tag changed since
//!   the follower's last acknowledged round, `None` for deleted grains.
//!
//! A failure towards one follower is logged and forgets what it
//! acknowledged, so the next round repairs it with a full copy. Other
//! followers are unaffected.
//!
//! # Ring events
//!
//! | Event | Action |
//! |---|---|
//! | `X` joins as my predecessor | hand off the grains `X` now owns, keep them as `X`'s replica |
//! | `X` joins elsewhere | split `X`'s share out of the replica of `X`'s successor |
//! | `X` leaves, I inherit | merge `X`'s replica into my partition |
//! | `X` leaves, someone else inherits | merge `X`'s replica into the heir's replica |
//! | I stop | push a full replica to my heir and wait for it |
//!
//! Ring events and inbound replica updates are processed one at a time
//! behind an async lock. The lock is never held across a call to a peer:
//! handlers decide under the lock and send afterwards.
//!
//! # Handoffs
//!
//! The share split out for a joining predecessor stays in the local
//! partition until the new owner acknowledges it. A failed transfer is kept
//! as a pending handoff and retried at the start of every round, until it
//! succeeds or the new owner leaves the ring again.
//!
//! # Orleans Reference
//!
//! `GrainDirectoryHandoffManager`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::context::DirectoryContext;
use crate::error::DirectoryError;
use crate::partition::{DirectoryPartition, GrainInfo, PartitionDelta};
use crate::providers::{Providers, TaskProvider};
use crate::types::{GrainCategory, GrainId, NodeAddress, VersionTag};

type Acknowledged = HashMap<GrainId, VersionTag>;

#[derive(Default)]
struct ReplicationState {
    /// Replicas held for predecessors, by source node.
    replicas: HashMap<NodeAddress, DirectoryPartition>,
    /// Nodes holding a replica of this node's partition.
    followers: Vec<NodeAddress>,
    /// Per follower, the tags of its last successful round.
    acknowledged: HashMap<NodeAddress, Acknowledged>,
    /// Shares split out for a new owner that has not acknowledged them yet.
    pending_handoffs: HashMap<NodeAddress, DirectoryPartition>,
    round: u64,
    force_full: bool,
}

/// Replicates this node's partition and stores replicas of other nodes'.
pub(crate) struct ReplicationAgent<P: Providers> {
    ctx: Rc<DirectoryContext<P>>,
    state: RefCell<ReplicationState>,
    ring_events: Mutex<()>,
}

impl<P: Providers> ReplicationAgent<P> {
    pub(crate) fn new(ctx: Rc<DirectoryContext<P>>) -> Self {
        Self {
            ctx,
            state: RefCell::new(ReplicationState::default()),
            ring_events: Mutex::new(()),
        }
    }

    /// Periodic replication loop; exits when `shutdown` flips to `true` or
    /// its sender is dropped.
    pub(crate) async fn run(self: Rc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.ctx.config.replication_period();
        debug!(node = %self.ctx.me, ?period, "replication loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.ctx.sleep(period) => {
                    self.replicate_once().await;
                }
            }
        }
        debug!(node = %self.ctx.me, "replication loop stopped");
    }

    /// Make the next round a full round for every follower.
    pub(crate) fn force_full_replication(&self) {
        self.state.borrow_mut().force_full = true;
    }

    /// Run one replication round towards every follower.
    pub(crate) async fn replicate_once(&self) {
        self.hand_off_pending().await;

        let (followers, periodic_full, forced, acknowledged) = {
            let mut state = self.state.borrow_mut();
            state.round += 1;
            let periodic_full = self
                .ctx
                .config
                .full_replication_cycle()
                .is_some_and(|cycle| cycle > 0 && state.round % cycle == 0);
            let forced = std::mem::take(&mut state.force_full);
            (
                state.followers.clone(),
                periodic_full,
                forced,
                state.acknowledged.clone(),
            )
        };
        if followers.is_empty() {
            return;
        }

        let items = self.ctx.partition.get_items();
        let tags: Acknowledged = items
            .iter()
            .map(|(grain, info)| (grain.clone(), info.version_tag()))
            .collect();

        let pushes = followers.iter().map(|follower| {
            let previous = acknowledged.get(follower);
            let full = forced || periodic_full || previous.is_none();
            let delta = match previous {
                Some(previous) if !full => delta_since(previous, &items),
                _ => full_copy(&items),
            };
            async move {
                if !full && delta.is_empty() {
                    return (follower, Ok(()));
                }
                debug!(
                    node = %self.ctx.me,
                    follower = %follower,
                    full,
                    entries = delta.len(),
                    "replicating partition"
                );
                (follower, self.push(follower, delta, full).await)
            }
        });
        let results = join_all(pushes).await;

        let mut state = self.state.borrow_mut();
        for (follower, result) in results {
            match result {
                Ok(()) => {
                    state.acknowledged.insert(follower.clone(), tags.clone());
                }
                Err(error) => {
                    warn!(node = %self.ctx.me, follower = %follower, %error, "replication to follower failed");
                    state.acknowledged.remove(follower);
                }
            }
        }
    }

    /// Send `delta` to `follower` in chunks; only the first chunk carries
    /// `is_full`.
    async fn push(
        &self,
        follower: &NodeAddress,
        delta: PartitionDelta,
        is_full: bool,
    ) -> Result<(), DirectoryError> {
        let peer = self.ctx.peer(follower)?;
        let chunk_size = self.ctx.config.replication_chunk_size();
        let mut entries: Vec<(GrainId, Option<GrainInfo>)> = delta.into_iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut chunks: Vec<PartitionDelta> = entries
            .chunks(chunk_size)
            .map(|chunk| chunk.iter().cloned().collect())
            .collect();
        if chunks.is_empty() {
            // an empty full round still clears the replica
            chunks.push(PartitionDelta::new());
        }
        for (index, chunk) in chunks.into_iter().enumerate() {
            let full = is_full && index == 0;
            self.ctx
                .call(
                    follower,
                    peer.register_replica(self.ctx.me.clone(), chunk, full),
                )
                .await?;
        }
        Ok(())
    }

    /// Store a chunk of `source`'s partition.
    ///
    /// A chunk from a departed node whose range this node already inherited
    /// goes straight into the local partition.
    pub(crate) async fn register_replica(
        &self,
        source: NodeAddress,
        chunk: PartitionDelta,
        is_full: bool,
    ) {
        let _guard = self.ring_events.lock().await;
        debug!(node = %self.ctx.me, source = %source, is_full, entries = chunk.len(), "registering replica");
        let inherited = {
            let ring = self.ctx.ring.borrow();
            !ring.contains(&source)
                && ring.owner_of_hash(source.consistent_hash(), false).as_ref()
                    == Some(&self.ctx.me)
        };
        let departed = self
            .ctx
            .membership
            .status(&source)
            .is_some_and(|status| status.is_terminating());
        if inherited && departed {
            let incoming = self.empty_partition();
            incoming.update(chunk);
            let duplicates = self.ctx.partition.merge(&incoming);
            info!(
                node = %self.ctx.me,
                source = %source,
                grains = incoming.len(),
                "merged handoff from departed node"
            );
            if !duplicates.is_empty() {
                self.ctx.deactivator.deactivate_activations(duplicates);
            }
            return;
        }
        let mut state = self.state.borrow_mut();
        let replica = state
            .replicas
            .entry(source)
            .or_insert_with(|| self.empty_partition());
        if is_full {
            replica.set(
                chunk
                    .into_iter()
                    .filter_map(|(grain, info)| info.map(|info| (grain, info)))
                    .collect(),
            );
        } else {
            replica.update(chunk);
        }
    }

    /// Drop the replica held for `source`.
    pub(crate) async fn unregister_replica(&self, source: &NodeAddress) {
        let _guard = self.ring_events.lock().await;
        if self.state.borrow_mut().replicas.remove(source).is_some() {
            debug!(node = %self.ctx.me, source = %source, "dropped replica");
        }
    }

    /// Replicated entries of `grain`, by the node they were replicated from.
    pub(crate) fn replicated_info(&self, grain: &GrainId) -> Vec<(NodeAddress, GrainInfo)> {
        let state = self.state.borrow();
        let mut found: Vec<(NodeAddress, GrainInfo)> = state
            .replicas
            .iter()
            .filter_map(|(source, replica)| {
                replica
                    .get_grain_info(grain)
                    .map(|info| (source.clone(), info))
            })
            .collect();
        found.sort_by_key(|(source, _)| source.consistent_hash());
        found
    }

    /// Nodes this node holds a replica for.
    pub(crate) fn replica_sources(&self) -> Vec<NodeAddress> {
        let mut sources: Vec<NodeAddress> = self.state.borrow().replicas.keys().cloned().collect();
        sources.sort_by_key(NodeAddress::consistent_hash);
        sources
    }

    /// Current followers.
    pub(crate) fn followers(&self) -> Vec<NodeAddress> {
        self.state.borrow().followers.clone()
    }

    /// Recompute followers from the ring. Nodes that stop being followers
    /// are told to drop their replica.
    pub(crate) fn reset_followers(&self) {
        let factor = self.ctx.config.replication_factor();
        let followers = self.ctx.ring.borrow().find_successors(&self.ctx.me, factor);
        let dropped: Vec<NodeAddress> = {
            let mut state = self.state.borrow_mut();
            let dropped: Vec<NodeAddress> = state
                .followers
                .iter()
                .filter(|old| !followers.contains(old))
                .cloned()
                .collect();
            for node in &dropped {
                state.acknowledged.remove(node);
            }
            state.followers = followers;
            dropped
        };
        for node in dropped {
            let Ok(peer) = self.ctx.peer(&node) else {
                continue;
            };
            let me = self.ctx.me.clone();
            self.ctx
                .providers
                .task()
                .spawn_task("unregister_replica", async move {
                    if let Err(error) = peer.unregister_replica(me).await {
                        debug!(node = %node, %error, "failed to drop replica on former follower");
                    }
                });
        }
    }

    /// Keep only replicas of nodes this node still follows.
    fn drop_stale_replicas(&self) {
        let factor = self.ctx.config.replication_factor();
        let predecessors = self
            .ctx
            .ring
            .borrow()
            .find_predecessors(&self.ctx.me, factor);
        self.state.borrow_mut().replicas.retain(|source, _| {
            let keep = predecessors.contains(source);
            if !keep {
                debug!(source = %source, "dropping replica of a node no longer followed");
            }
            keep
        });
    }

    /// Handle `added` joining the ring. The ring already contains it.
    pub(crate) async fn on_node_added(&self, added: NodeAddress) {
        let handoff = {
            let _guard = self.ring_events.lock().await;
            self.split_for_added(&added)
        };
        if handoff {
            self.hand_off_pending().await;
        }
    }

    /// Ring bookkeeping for a joining node. Returns `true` when a share of
    /// the local partition now waits to be handed off to `added`.
    fn split_for_added(&self, added: &NodeAddress) -> bool {
        let me = self.ctx.me.clone();
        let factor = self.ctx.config.replication_factor();
        let (is_predecessor, follows_added, successor) = {
            let ring = self.ctx.ring.borrow();
            (
                ring.find_predecessors(&me, 1).first() == Some(added),
                ring.find_predecessors(&me, factor).contains(added),
                ring.find_successors(added, 1).into_iter().next(),
            )
        };

        let mut handoff = false;
        if is_predecessor {
            let owned_elsewhere = |grain: &GrainId| {
                grain.category() == GrainCategory::Application
                    && self
                        .ctx
                        .ring
                        .borrow()
                        .owner_of_hash(grain.uniform_hash(), false)
                        .as_ref()
                        != Some(&me)
            };
            let moved = self.ctx.partition.split(owned_elsewhere, false);
            if !moved.is_empty() {
                info!(node = %me, new_owner = %added, grains = moved.len(), "handing off partition share");
                let pending = self.copy_of(&moved);
                self.state
                    .borrow_mut()
                    .pending_handoffs
                    .insert(added.clone(), pending);
                handoff = true;
            }
            if factor > 0 {
                self.state
                    .borrow_mut()
                    .replicas
                    .insert(added.clone(), moved);
            }
        } else if factor > 0 {
            if let Some(successor) = successor {
                let split = {
                    let state = self.state.borrow();
                    let ring = self.ctx.ring.borrow();
                    state.replicas.get(&successor).map(|replica| {
                        replica.split(
                            |grain| {
                                grain.category() == GrainCategory::Application
                                    && ring.owner_of_hash(grain.uniform_hash(), false).as_ref()
                                        == Some(added)
                            },
                            true,
                        )
                    })
                };
                match split {
                    Some(share) if follows_added => {
                        self.state
                            .borrow_mut()
                            .replicas
                            .insert(added.clone(), share);
                    }
                    Some(_) => {}
                    None if successor != me && follows_added => {
                        warn!(node = %me, successor = %successor, "no replica held for the successor of a joining node");
                    }
                    None => {}
                }
            }
        }

        self.drop_stale_replicas();
        self.reset_followers();
        handoff
    }

    /// Retry every pending handoff. An acknowledged share leaves the local
    /// partition, except for grains the ring has routed back to this node
    /// in the meantime.
    async fn hand_off_pending(&self) {
        let pending: Vec<(NodeAddress, DirectoryPartition)> = self
            .state
            .borrow()
            .pending_handoffs
            .iter()
            .map(|(owner, share)| (owner.clone(), self.copy_of(share)))
            .collect();

        for (owner, share) in pending {
            if let Err(error) = self.transfer(&owner, &share).await {
                warn!(node = %self.ctx.me, new_owner = %owner, %error, "partition handoff failed, will retry");
                continue;
            }
            let _guard = self.ring_events.lock().await;
            if self
                .state
                .borrow_mut()
                .pending_handoffs
                .remove(&owner)
                .is_none()
            {
                // the new owner left while the transfer was in flight
                continue;
            }
            let ring = self.ctx.ring.borrow();
            let mut removed = 0;
            for grain in share.get_items().keys() {
                if ring.owner_of_hash(grain.uniform_hash(), false).as_ref() != Some(&self.ctx.me) {
                    self.ctx.partition.remove_grain(grain);
                    removed += 1;
                }
            }
            info!(node = %self.ctx.me, new_owner = %owner, grains = removed, "partition handoff acknowledged");
        }
    }

    /// Pending handoffs, by new owner.
    pub(crate) fn pending_handoffs(&self) -> Vec<(NodeAddress, usize)> {
        let mut pending: Vec<(NodeAddress, usize)> = self
            .state
            .borrow()
            .pending_handoffs
            .iter()
            .map(|(owner, share)| (owner.clone(), share.len()))
            .collect();
        pending.sort_by_key(|(owner, _)| owner.consistent_hash());
        pending
    }

    /// Send `moved` to its new owner, single activations with their status.
    async fn transfer(
        &self,
        owner: &NodeAddress,
        moved: &DirectoryPartition,
    ) -> Result<(), DirectoryError> {
        let peer = self.ctx.peer(owner)?;
        let retries = self.ctx.config.retries();
        let singles = moved.to_list_with_status(true);
        if !singles.is_empty() {
            self.ctx
                .call(
                    owner,
                    peer.register_many_single_activation(singles, retries),
                )
                .await?;
        }
        let multis = moved.to_list_of_activations(false);
        if !multis.is_empty() {
            self.ctx
                .call(owner, peer.register_many(multis, retries))
                .await?;
        }
        Ok(())
    }

    /// Handle `removed` leaving the ring. The ring no longer contains it.
    pub(crate) async fn on_node_removed(&self, removed: NodeAddress) {
        let _guard = self.ring_events.lock().await;
        let me = self.ctx.me.clone();
        let heir = self
            .ctx
            .ring
            .borrow()
            .owner_of_hash(removed.consistent_hash(), false);
        let replica = {
            let mut state = self.state.borrow_mut();
            if state.pending_handoffs.remove(&removed).is_some() {
                debug!(node = %me, removed = %removed, "dropped handoff to removed node");
            }
            state.replicas.remove(&removed)
        };

        if let (Some(replica), Some(heir)) = (replica, heir) {
            if heir == me {
                let duplicates = self.ctx.partition.merge(&replica);
                info!(
                    node = %me,
                    removed = %removed,
                    grains = replica.len(),
                    duplicates = duplicates.len(),
                    "promoted replica of removed node"
                );
                if !duplicates.is_empty() {
                    self.ctx.deactivator.deactivate_activations(duplicates);
                }
            } else {
                let mut state = self.state.borrow_mut();
                match state.replicas.get(&heir) {
                    Some(heir_replica) => {
                        heir_replica.merge(&replica);
                    }
                    None => {
                        state.replicas.insert(heir.clone(), replica);
                    }
                }
                debug!(node = %me, removed = %removed, heir = %heir, "folded replica into heir's replica");
            }
        }

        self.purge_node(&removed);
        self.drop_stale_replicas();
        self.reset_followers();
    }

    /// Forget every activation hosted on `removed`.
    fn purge_node(&self, removed: &NodeAddress) {
        let stale: Vec<_> = [true, false]
            .into_iter()
            .flat_map(|single| self.ctx.partition.to_list_of_activations(single))
            .filter(|address| address.node == *removed)
            .collect();
        if !stale.is_empty() {
            debug!(node = %self.ctx.me, removed = %removed, count = stale.len(), "removing activations of removed node");
        }
        for address in stale {
            self.ctx
                .partition
                .remove_activation(&address.grain, &address.activation, true);
        }
    }

    /// Push a full replica to the node that will inherit this node's range
    /// and wait for it to be acknowledged.
    pub(crate) async fn on_stopping(&self) -> Result<(), DirectoryError> {
        let (heir, items) = {
            let _guard = self.ring_events.lock().await;
            let heir = match self.followers().into_iter().next() {
                Some(heir) => Some(heir),
                None => self
                    .ctx
                    .ring
                    .borrow()
                    .find_successors(&self.ctx.me, 1)
                    .into_iter()
                    .next(),
            };
            (heir, self.ctx.partition.get_items())
        };
        let Some(heir) = heir else {
            debug!(node = %self.ctx.me, "no heir to hand the partition to");
            return Ok(());
        };
        info!(node = %self.ctx.me, heir = %heir, grains = items.len(), "pushing partition to heir before stopping");
        self.push(&heir, full_copy(&items), true).await
    }

    fn copy_of(&self, partition: &DirectoryPartition) -> DirectoryPartition {
        let copy = self.empty_partition();
        copy.set(partition.get_items());
        copy
    }

    fn empty_partition(&self) -> DirectoryPartition {
        DirectoryPartition::new(
            self.ctx.me.cluster(),
            self.ctx.config.lazy_deregistration_delay(),
        )
    }
}

fn full_copy(items: &HashMap<GrainId, GrainInfo>) -> PartitionDelta {
    items
        .iter()
        .map(|(grain, info)| (grain.clone(), Some(info.clone())))
        .collect()
}

fn delta_since(acknowledged: &Acknowledged, items: &HashMap<GrainId, GrainInfo>) -> PartitionDelta {
    let mut delta: PartitionDelta = items
        .iter()
        .filter(|(grain, info)| acknowledged.get(*grain) != Some(&info.version_tag()))
        .map(|(grain, info)| (grain.clone(), Some(info.clone())))
        .collect();
    delta.extend(
        acknowledged
            .keys()
            .filter(|grain| !items.contains_key(*grain))
            .map(|grain| (grain.clone(), None)),
    );
    delta
}
