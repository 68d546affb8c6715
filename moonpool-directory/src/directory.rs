//! Grain directory facade: the entry point a node's runtime talks to.
//!
//! [`LocalGrainDirectory`] decides, for every request, whether this node
//! owns the grain's entry. Owned entries are read and mutated in the local
//! partition without suspending; everything else goes to the owner through
//! the peer network with the configured retry budget.
//!
//! Lookups are two-tiered:
//!
//! 1. [`LocalGrainDirectory::local_lookup`] answers from the partition when
//!    this node owns the grain, else from the cache. It never leaves the
//!    node.
//! 2. [`LocalGrainDirectory::full_lookup`] asks the owner and fills the
//!    cache. Only a local miss justifies it; [`LocalGrainDirectory::lookup`]
//!    chains both.
//!
//! Unregistrations invalidate the cache before the round trip, so a caller
//! never reads back an activation it just removed.
//!
//! # Membership
//!
//! The facade is a [`MembershipListener`]. Status changes of other nodes
//! update the ring and start the handoff in the replication agent; a status
//! change of this node stops the directory.
//!
//! # Example
//!
//! ```rust,ignore
//! let directory = LocalGrainDirectory::builder(me.clone(), config, TokioProviders::new())
//!     .membership(membership.clone())
//!     .network(network.clone())
//!     .deactivator(catalog.clone())
//!     .build()?;
//! network.register(me.clone(), Rc::downgrade(&directory.peer()));
//! membership.subscribe(directory.listener());
//! directory.start();
//!
//! let winner = directory.register_single_activation(address).await?;
//! ```
//!
//! # Orleans Reference
//!
//! `LocalGrainDirectory`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::maintainer::CacheMaintainer;
use crate::cache::{create_cache, CachedActivations};
use crate::catalog::ActivationDeactivator;
use crate::config::{CacheStrategy, DirectoryConfig};
use crate::context::DirectoryContext;
use crate::error::{DirectoryConfigError, DirectoryError};
use crate::membership::{MembershipListener, MembershipView, NodeStatus};
use crate::partition::{DirectoryPartition, GrainInfo};
use crate::providers::{Providers, TaskProvider};
use crate::remote::RemoteGrainDirectory;
use crate::replication::ReplicationAgent;
use crate::ring::RingPartitioner;
use crate::transport::{
    ClusterGateway, DirectoryPeer, LookupResult, MultiClusterNetwork, NoRemoteClusters, PeerNetwork,
};
use crate::types::{ActivationAddress, GrainId, NodeAddress};

/// One node's grain directory.
pub struct LocalGrainDirectory<P: Providers> {
    ctx: Rc<DirectoryContext<P>>,
    remote: Rc<RemoteGrainDirectory<P>>,
    replication: Rc<ReplicationAgent<P>>,
    maintainer: Rc<CacheMaintainer<P>>,
    shutdown: watch::Sender<bool>,
    stop_prepared: watch::Sender<bool>,
    started: Cell<bool>,
    stopping: Cell<bool>,
    this: Weak<Self>,
}

impl<P: Providers> fmt::Debug for LocalGrainDirectory<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalGrainDirectory")
            .field("me", &self.ctx.me)
            .field("running", &self.ctx.is_running())
            .field("partition", &self.ctx.partition.len())
            .field("cache", &self.ctx.cache.borrow().len())
            .finish()
    }
}

/// Builder for [`LocalGrainDirectory`].
pub struct LocalGrainDirectoryBuilder<P: Providers> {
    me: NodeAddress,
    config: DirectoryConfig,
    providers: P,
    membership: Option<Rc<dyn MembershipView>>,
    network: Option<Rc<dyn PeerNetwork>>,
    clusters: Rc<dyn MultiClusterNetwork>,
    deactivator: Option<Rc<dyn ActivationDeactivator>>,
}

impl<P: Providers> LocalGrainDirectoryBuilder<P> {
    /// Membership view of the local cluster. Required.
    pub fn membership(mut self, membership: Rc<dyn MembershipView>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Network to the other nodes of the local cluster. Required.
    pub fn network(mut self, network: Rc<dyn PeerNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    /// Network to other clusters. Defaults to [`NoRemoteClusters`].
    pub fn clusters(mut self, clusters: Rc<dyn MultiClusterNetwork>) -> Self {
        self.clusters = clusters;
        self
    }

    /// Catalog hook for activations the directory gives up on. Required.
    pub fn deactivator(mut self, deactivator: Rc<dyn ActivationDeactivator>) -> Self {
        self.deactivator = Some(deactivator);
        self
    }

    /// Assemble the directory. It does nothing until
    /// [`LocalGrainDirectory::start`].
    pub fn build(self) -> Result<Rc<LocalGrainDirectory<P>>, DirectoryConfigError> {
        let membership = self
            .membership
            .ok_or(DirectoryConfigError::MissingMembership)?;
        let network = self.network.ok_or(DirectoryConfigError::MissingNetwork)?;
        let deactivator = self
            .deactivator
            .ok_or(DirectoryConfigError::MissingDeactivator)?;

        let ctx = Rc::new(DirectoryContext {
            ring: RefCell::new(RingPartitioner::new(
                self.me.clone(),
                self.config.seed().cloned(),
            )),
            partition: DirectoryPartition::new(
                self.me.cluster(),
                self.config.lazy_deregistration_delay(),
            ),
            cache: RefCell::new(create_cache(&self.config)),
            me: self.me,
            config: self.config,
            providers: self.providers,
            membership,
            network,
            clusters: self.clusters,
            deactivator,
        });
        let replication = Rc::new(ReplicationAgent::new(ctx.clone()));
        let remote = RemoteGrainDirectory::new(ctx.clone(), replication.clone());
        let maintainer = Rc::new(CacheMaintainer::new(ctx.clone()));
        // the directory starts stopped until start() flips the ring
        ctx.ring.borrow_mut().set_running(false);

        Ok(Rc::new_cyclic(|this| LocalGrainDirectory {
            ctx,
            remote,
            replication,
            maintainer,
            shutdown: watch::Sender::new(false),
            stop_prepared: watch::Sender::new(false),
            started: Cell::new(false),
            stopping: Cell::new(false),
            this: this.clone(),
        }))
    }
}

impl<P: Providers> LocalGrainDirectory<P> {
    /// Start building the directory of node `me`.
    pub fn builder(
        me: NodeAddress,
        config: DirectoryConfig,
        providers: P,
    ) -> LocalGrainDirectoryBuilder<P> {
        LocalGrainDirectoryBuilder {
            me,
            config,
            providers,
            membership: None,
            network: None,
            clusters: Rc::new(NoRemoteClusters),
            deactivator: None,
        }
    }

    /// The node this directory runs on.
    pub fn me(&self) -> &NodeAddress {
        &self.ctx.me
    }

    /// Active configuration.
    pub fn config(&self) -> &DirectoryConfig {
        &self.ctx.config
    }

    /// Whether the directory accepts ownership of new entries.
    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    /// The RPC surface peers call, for registration in a [`PeerNetwork`].
    pub fn peer(&self) -> Rc<dyn DirectoryPeer> {
        self.remote.clone()
    }

    /// The cross-cluster surface, for registration in a
    /// [`MultiClusterNetwork`] when this node is its cluster's gateway.
    pub fn gateway(&self) -> Rc<dyn ClusterGateway> {
        self.remote.clone()
    }

    /// This directory as a membership listener.
    pub fn listener(self: &Rc<Self>) -> Weak<dyn MembershipListener> {
        let listener: Rc<dyn MembershipListener> = self.clone();
        Rc::downgrade(&listener)
    }

    /// Join the ring with every active member and start the background
    /// loops: replication, cache refresh (adaptive cache only) and
    /// anti-entropy (when a period is configured).
    pub fn start(&self) {
        if self.started.replace(true) {
            return;
        }
        {
            let mut ring = self.ctx.ring.borrow_mut();
            ring.set_running(true);
            for node in self.ctx.membership.active_members() {
                if node.is_same_cluster(&self.ctx.me) {
                    ring.add_member(node);
                }
            }
        }
        self.replication.reset_followers();
        info!(node = %self.ctx.me, ring = %self.ring_status(), "grain directory started");

        let task = self.ctx.providers.task();
        task.spawn_task(
            "directory_replication",
            self.replication.clone().run(self.shutdown.subscribe()),
        );
        if self.ctx.config.cache_strategy() == CacheStrategy::Adaptive {
            task.spawn_task(
                "directory_cache_maintainer",
                self.maintainer.clone().run(self.shutdown.subscribe()),
            );
        }
        if let Some(period) = self.ctx.config.anti_entropy_period() {
            task.spawn_task(
                "directory_anti_entropy",
                self.remote
                    .clone()
                    .run_anti_entropy(period, self.shutdown.subscribe()),
            );
        }
    }

    /// Stop the directory.
    ///
    /// With `replicate`, a full copy of the partition is pushed to the node
    /// inheriting this node's range first, and the result of that handoff
    /// is returned. The partition and cache are cleared either way.
    pub async fn stop(&self, replicate: bool) -> Result<(), DirectoryError> {
        if self.stopping.replace(true) {
            return Ok(());
        }
        info!(node = %self.ctx.me, replicate, "stopping grain directory");
        self.ctx.ring.borrow_mut().set_running(false);

        let handoff = if replicate {
            self.replication.on_stopping().await
        } else {
            Ok(())
        };
        if let Err(error) = &handoff {
            warn!(node = %self.ctx.me, %error, "handoff before stopping failed");
        }
        self.stop_prepared.send_replace(true);
        self.shutdown.send_replace(true);
        self.ctx.partition.clear();
        self.ctx.cache.borrow_mut().clear();
        handoff
    }

    /// Resolves once [`LocalGrainDirectory::stop`] finished handing off the
    /// partition.
    pub async fn stop_preparation_completed(&self) {
        let mut prepared = self.stop_prepared.subscribe();
        // the sender lives as long as self
        let _ = prepared.wait_for(|done| *done).await;
    }

    /// Register a multi-activation instance.
    pub async fn register(
        &self,
        address: ActivationAddress,
    ) -> Result<ActivationAddress, DirectoryError> {
        let owner = self.ctx.owner(&address.grain)?;
        if owner == self.ctx.me {
            return self.ctx.partition.add_activation(
                &address.grain,
                address.activation,
                address.node,
            );
        }
        let peer = self.ctx.peer(&owner)?;
        self.ctx
            .call(&owner, peer.register(address, self.ctx.config.retries()))
            .await
    }

    /// Register the single activation of a grain.
    ///
    /// Returns the activation that holds the grain, which is `address`
    /// only if it won. Losing is not an error.
    pub async fn register_single_activation(
        &self,
        address: ActivationAddress,
    ) -> Result<ActivationAddress, DirectoryError> {
        let owner = self.ctx.owner(&address.grain)?;
        if owner == self.ctx.me {
            return Ok(self.remote.register_single_local(address));
        }
        let peer = self.ctx.peer(&owner)?;
        self.ctx
            .call(
                &owner,
                peer.register_single_activation(address, self.ctx.config.retries()),
            )
            .await
    }

    /// Register a system activation in the local partition, without
    /// routing and without the cross-cluster protocol.
    pub fn register_single_activation_local(
        &self,
        address: ActivationAddress,
    ) -> ActivationAddress {
        self.ctx
            .partition
            .add_system_activation(&address.grain, address.activation, address.node)
    }

    /// Remove an activation.
    ///
    /// Without `force`, the owner only removes it if it was registered
    /// within the lazy deregistration delay.
    pub async fn unregister(
        &self,
        address: ActivationAddress,
        force: bool,
    ) -> Result<(), DirectoryError> {
        self.invalidate_cache_entry_partly(&address);
        let owner = self.ctx.owner(&address.grain)?;
        if owner == self.ctx.me {
            self.ctx
                .partition
                .remove_activation(&address.grain, &address.activation, force);
            return Ok(());
        }
        let peer = self.ctx.peer(&owner)?;
        self.ctx
            .call(
                &owner,
                peer.unregister(address, force, self.ctx.config.retries()),
            )
            .await
    }

    /// Lazily remove an activation that is deactivating shortly after
    /// registration. A no-op when lazy deregistration is disabled.
    pub async fn unregister_conditionally(
        &self,
        address: ActivationAddress,
    ) -> Result<(), DirectoryError> {
        if self.ctx.config.lazy_deregistration_delay().is_zero() {
            return Ok(());
        }
        self.unregister(address, false).await
    }

    /// Remove many activations, one batch per owner.
    ///
    /// Every address and every batch is attempted; the first failure is
    /// returned.
    pub async fn unregister_many(
        &self,
        addresses: Vec<ActivationAddress>,
    ) -> Result<(), DirectoryError> {
        let mut by_owner: HashMap<NodeAddress, Vec<ActivationAddress>> = HashMap::new();
        let mut unroutable = None;
        for address in addresses {
            self.invalidate_cache_entry_partly(&address);
            match self.ctx.owner(&address.grain) {
                Ok(owner) if owner == self.ctx.me => {
                    self.ctx
                        .partition
                        .remove_activation(&address.grain, &address.activation, true);
                }
                Ok(owner) => by_owner.entry(owner).or_default().push(address),
                Err(error) => {
                    warn!(activation = %address, %error, "cannot route unregistration");
                    unroutable.get_or_insert(error);
                }
            }
        }

        let retries = self.ctx.config.retries();
        let calls = by_owner.into_iter().map(|(owner, batch)| async move {
            let result = match self.ctx.peer(&owner) {
                Ok(peer) => {
                    self.ctx
                        .call(&owner, peer.unregister_many(batch, retries))
                        .await
                }
                Err(error) => Err(error),
            };
            if let Err(error) = &result {
                warn!(owner = %owner, %error, "batch unregistration failed");
            }
            result
        });
        let batches: Result<(), DirectoryError> = join_all(calls).await.into_iter().collect();
        match unroutable {
            Some(error) => Err(error),
            None => batches,
        }
    }

    /// Remove a grain and every activation it has.
    pub async fn delete_grain(&self, grain: GrainId) -> Result<(), DirectoryError> {
        self.invalidate_cache_entry(&grain);
        let owner = self.ctx.owner(&grain)?;
        if owner == self.ctx.me {
            self.ctx.partition.remove_grain(&grain);
            return Ok(());
        }
        let peer = self.ctx.peer(&owner)?;
        self.ctx
            .call(&owner, peer.delete_grain(grain, self.ctx.config.retries()))
            .await
    }

    /// Answer a lookup without leaving the node.
    ///
    /// `Some` is authoritative when this node owns the grain (possibly
    /// empty) and a cache hit otherwise. `None` means a
    /// [`LocalGrainDirectory::full_lookup`] is needed.
    pub fn local_lookup(
        &self,
        grain: &GrainId,
    ) -> Result<Option<Vec<ActivationAddress>>, DirectoryError> {
        let owner = self.ctx.owner(grain)?;
        if owner == self.ctx.me {
            let activations = self
                .ctx
                .partition
                .lookup(grain)
                .map(|(activations, _)| self.ctx.valid_only(activations))
                .unwrap_or_default();
            return Ok(Some(activations));
        }

        let mut cache = self.ctx.cache.borrow_mut();
        let Some(cached) = cache.lookup(grain) else {
            return Ok(None);
        };
        let activations: Vec<ActivationAddress> = cached
            .into_iter()
            .filter(|(node, _)| self.ctx.is_valid(node))
            .map(|(node, activation)| ActivationAddress::new(grain.clone(), node, activation))
            .collect();
        if activations.is_empty() {
            cache.remove(grain);
            return Ok(None);
        }
        Ok(Some(activations))
    }

    /// Ask the owner and cache its answer.
    pub async fn full_lookup(&self, grain: &GrainId) -> Result<LookupResult, DirectoryError> {
        let owner = self.ctx.owner(grain)?;
        if !self.ctx.is_valid(&owner) {
            return Err(DirectoryError::UnstableRing {
                grain: grain.clone(),
                owner,
                node: self.ctx.me.clone(),
            });
        }
        if owner == self.ctx.me {
            return Ok(match self.ctx.partition.lookup(grain) {
                Some((activations, tag)) => LookupResult {
                    activations: self.ctx.valid_only(activations),
                    version_tag: Some(tag),
                },
                None => LookupResult::default(),
            });
        }

        let peer = self.ctx.peer(&owner)?;
        let result = self
            .ctx
            .call(
                &owner,
                peer.lookup(grain.clone(), self.ctx.config.retries()),
            )
            .await?;
        match result.version_tag {
            Some(tag) if !result.activations.is_empty() => {
                let value: CachedActivations = result
                    .activations
                    .iter()
                    .map(|address| (address.node.clone(), address.activation))
                    .collect();
                self.ctx
                    .cache
                    .borrow_mut()
                    .add_or_update(grain.clone(), value, tag);
            }
            _ => {
                self.ctx.cache.borrow_mut().remove(grain);
            }
        }
        Ok(result)
    }

    /// [`LocalGrainDirectory::local_lookup`], falling back to
    /// [`LocalGrainDirectory::full_lookup`] on a miss.
    pub async fn lookup(&self, grain: &GrainId) -> Result<Vec<ActivationAddress>, DirectoryError> {
        if let Some(activations) = self.local_lookup(grain)? {
            return Ok(activations);
        }
        Ok(self.full_lookup(grain).await?.activations)
    }

    /// Forget the cached entry of `grain`.
    pub fn invalidate_cache_entry(&self, grain: &GrainId) {
        self.ctx.cache.borrow_mut().remove(grain);
    }

    /// Drop one activation from the cached entry of its grain.
    pub fn invalidate_cache_entry_partly(&self, address: &ActivationAddress) {
        self.ctx
            .cache
            .borrow_mut()
            .remove_activation(&address.grain, &address.activation);
    }

    /// Run one anti-entropy round for this cluster.
    pub async fn reconcile_doubtful_activations(&self) -> Result<(), DirectoryError> {
        self.remote.reconcile_doubtful_activations().await
    }

    /// Run one replication round now; `full` forces a full copy.
    pub async fn replicate_now(&self, full: bool) {
        if full {
            self.replication.force_full_replication();
        }
        self.replication.replicate_once().await;
    }

    /// Revalidate expired cache entries now.
    pub async fn refresh_cache_now(&self) {
        self.maintainer.refresh_once().await;
    }

    /// Directory owner of `grain`.
    pub fn get_primary_for_grain(&self, grain: &GrainId) -> Result<NodeAddress, DirectoryError> {
        self.ctx.owner(grain)
    }

    /// Nodes that should hold a replica of `grain`'s entry.
    pub fn get_replicas_for_grain(
        &self,
        grain: &GrainId,
    ) -> Result<Vec<NodeAddress>, DirectoryError> {
        let primary = self.ctx.owner(grain)?;
        Ok(self
            .ctx
            .ring
            .borrow()
            .find_successors(&primary, self.ctx.config.replication_factor()))
    }

    /// Entry of `grain` in this node's partition.
    pub fn get_local_data_for_grain(&self, grain: &GrainId) -> Option<GrainInfo> {
        self.ctx.partition.get_grain_info(grain)
    }

    /// Replicated entries of `grain` held here, by source node.
    pub fn get_replicated_data_for_grain(&self, grain: &GrainId) -> Vec<(NodeAddress, GrainInfo)> {
        self.replication.replicated_info(grain)
    }

    /// Cached activations of `grain`, without touching recency.
    pub fn get_cached_data_for_grain(&self, grain: &GrainId) -> Option<CachedActivations> {
        self.ctx
            .cache
            .borrow()
            .key_values()
            .into_iter()
            .find(|(cached, _, _)| cached == grain)
            .map(|(_, value, _)| value)
    }

    /// Nodes this node holds a replica for.
    pub fn replica_sources(&self) -> Vec<NodeAddress> {
        self.replication.replica_sources()
    }

    /// Nodes holding a replica of this node's partition.
    pub fn followers(&self) -> Vec<NodeAddress> {
        self.replication.followers()
    }

    /// Partition shares still waiting for their new owner to acknowledge
    /// them, with their grain counts.
    pub fn pending_handoffs(&self) -> Vec<(NodeAddress, usize)> {
        self.replication.pending_handoffs()
    }

    /// Number of grains in this node's partition.
    pub fn partition_len(&self) -> usize {
        self.ctx.partition.len()
    }

    /// Number of cached grains.
    pub fn cache_len(&self) -> usize {
        self.ctx.cache.borrow().len()
    }

    /// Ring members as seen by this node.
    pub fn ring_members(&self) -> Vec<NodeAddress> {
        self.ctx.ring.borrow().members().to_vec()
    }

    /// Ring members with their positions, for diagnostics.
    pub fn ring_status(&self) -> String {
        self.ctx.ring.borrow().status()
    }

    fn add_server(&self, node: NodeAddress) {
        if !self.ctx.ring.borrow_mut().add_member(node.clone()) {
            return;
        }
        info!(node = %self.ctx.me, added = %node, "node joined the directory ring");
        let replication = self.replication.clone();
        self.ctx
            .providers
            .task()
            .spawn_task("directory_node_added", async move {
                replication.on_node_added(node).await;
            });
    }

    fn remove_server(&self, node: NodeAddress) {
        if !self.ctx.ring.borrow_mut().remove_member(&node) {
            return;
        }
        info!(node = %self.ctx.me, removed = %node, "node left the directory ring");
        self.purge_cache(&node);
        let replication = self.replication.clone();
        self.ctx
            .providers
            .task()
            .spawn_task("directory_node_removed", async move {
                replication.on_node_removed(node).await;
            });
    }

    /// Drop cache entries pointing at `removed` or for grains this node now
    /// owns.
    fn purge_cache(&self, removed: &NodeAddress) {
        let stale: Vec<GrainId> = {
            let ring = self.ctx.ring.borrow();
            self.ctx
                .cache
                .borrow()
                .key_values()
                .into_iter()
                .filter(|(grain, value, _)| {
                    value.iter().any(|(node, _)| node == removed)
                        || matches!(ring.calculate_owner(grain, true), Ok(Some(owner)) if owner == self.ctx.me)
                })
                .map(|(grain, _, _)| grain)
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        debug!(node = %self.ctx.me, count = stale.len(), "purging cache after ring change");
        let mut cache = self.ctx.cache.borrow_mut();
        for grain in &stale {
            cache.remove(grain);
        }
    }

    fn stop_in_background(&self, replicate: bool) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.ctx
            .providers
            .task()
            .spawn_task("directory_stop", async move {
                if let Err(error) = this.stop(replicate).await {
                    warn!(node = %this.ctx.me, %error, "directory stop failed");
                }
            });
    }
}

impl<P: Providers> MembershipListener for LocalGrainDirectory<P> {
    fn on_status_change(&self, node: &NodeAddress, status: NodeStatus) {
        if *node == self.ctx.me {
            match status {
                NodeStatus::Stopping | NodeStatus::ShuttingDown => self.stop_in_background(true),
                NodeStatus::Dead => self.stop_in_background(false),
                NodeStatus::Joining | NodeStatus::Active => {}
            }
            return;
        }
        if !node.is_same_cluster(&self.ctx.me) {
            return;
        }
        match status {
            NodeStatus::Dead | NodeStatus::ShuttingDown | NodeStatus::Stopping => {
                self.remove_server(node.clone())
            }
            NodeStatus::Active => self.add_server(node.clone()),
            NodeStatus::Joining => {}
        }
    }
}
