//! Inbound side of the directory: what a node does when a peer calls it.
//!
//! [`RemoteGrainDirectory`] implements [`DirectoryPeer`] for requests from
//! nodes of the same cluster and [`ClusterGateway`] for requests from other
//! clusters. It also runs the two cross-cluster algorithms:
//!
//! - the **creation protocol**, started for every single activation accepted
//!   in `RequestedOwnership`, which asks every other cluster for permission
//!   and concludes with `Owned`, `Doubtful`, or a cached reference to the
//!   remote winner;
//! - **anti-entropy**, which settles `Doubtful` activations once the
//!   clusters that did not answer are reachable again.
//!
//! # Routing
//!
//! Every grain-addressed request is first checked against the local ring.
//! A node that is not the owner waits `retry_delay`, recomputes the owner
//! and forwards with one retry less; at zero it fails with
//! [`DirectoryError::NotOwner`].
//!
//! # Orleans Reference
//!
//! `RemoteGrainDirectory` and `ClusterGrainDirectory` of the geo-distributed
//! directory prototype.

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::DirectoryContext;
use crate::error::DirectoryError;
use crate::partition::{
    ActivationResponse, ActivationResponseStatus, ActivationStatus, DoubtfulSet, PartitionDelta,
};
use crate::providers::{Providers, TaskProvider, TimeProvider};
use crate::replication::ReplicationAgent;
use crate::transport::{ClusterGateway, DirectoryPeer, LookupManyEntry, LookupResult};
use crate::types::{ActivationAddress, ClusterId, GrainId, NodeAddress, VersionTag};

enum Route {
    Local,
    Forward { owner: NodeAddress, retries: u32 },
}

/// Request handler of one directory node.
pub struct RemoteGrainDirectory<P: Providers> {
    ctx: Rc<DirectoryContext<P>>,
    replication: Rc<ReplicationAgent<P>>,
    this: Weak<Self>,
}

impl<P: Providers> RemoteGrainDirectory<P> {
    pub(crate) fn new(
        ctx: Rc<DirectoryContext<P>>,
        replication: Rc<ReplicationAgent<P>>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            ctx,
            replication,
            this: this.clone(),
        })
    }

    async fn route(&self, grain: &GrainId, retries: u32) -> Result<Route, DirectoryError> {
        let owner = self.ctx.owner(grain)?;
        if owner == self.ctx.me {
            return Ok(Route::Local);
        }
        if retries == 0 {
            return Err(DirectoryError::NotOwner {
                grain: grain.clone(),
                owner,
                node: self.ctx.me.clone(),
            });
        }
        debug!(node = %self.ctx.me, grain = %grain, owner = %owner, retries, "not the owner, retrying");
        self.ctx.sleep(self.ctx.config.retry_delay()).await;
        let owner = self.ctx.owner(grain)?;
        if owner == self.ctx.me {
            Ok(Route::Local)
        } else {
            Ok(Route::Forward {
                owner,
                retries: retries - 1,
            })
        }
    }

    /// Split `items` into those owned here and those to forward, per owner,
    /// applying the same retry rule as [`RemoteGrainDirectory::route`].
    async fn route_many<T>(
        &self,
        items: Vec<T>,
        grain_of: impl Fn(&T) -> &GrainId,
        retries: u32,
    ) -> Result<(Vec<T>, HashMap<NodeAddress, Vec<T>>), DirectoryError> {
        let mut local = Vec::new();
        let mut elsewhere = Vec::new();
        for item in items {
            let owner = self.ctx.owner(grain_of(&item))?;
            if owner == self.ctx.me {
                local.push(item);
            } else {
                elsewhere.push((owner, item));
            }
        }
        let mut forward: HashMap<NodeAddress, Vec<T>> = HashMap::new();
        if elsewhere.is_empty() {
            return Ok((local, forward));
        }
        if retries == 0 {
            let (owner, item) = elsewhere.swap_remove(0);
            return Err(DirectoryError::NotOwner {
                grain: grain_of(&item).clone(),
                owner,
                node: self.ctx.me.clone(),
            });
        }
        self.ctx.sleep(self.ctx.config.retry_delay()).await;
        for (_, item) in elsewhere {
            let owner = self.ctx.owner(grain_of(&item))?;
            if owner == self.ctx.me {
                local.push(item);
            } else {
                forward.entry(owner).or_default().push(item);
            }
        }
        Ok((local, forward))
    }

    /// Register a single activation in the local partition. Starts the
    /// creation protocol when the activation is accepted.
    pub(crate) fn register_single_local(&self, address: ActivationAddress) -> ActivationAddress {
        if address.grain.is_system_target() {
            return self.ctx.partition.add_system_activation(
                &address.grain,
                address.activation,
                address.node,
            );
        }
        let (accepted, winner) = self.ctx.partition.add_single_activation(
            &address.grain,
            address.activation,
            address.node,
        );
        if accepted {
            self.start_creation_protocol(winner.clone());
        }
        winner
    }

    /// Run the creation protocol for `address` in the background, or
    /// conclude it immediately when there is no other cluster.
    fn start_creation_protocol(&self, address: ActivationAddress) {
        if self
            .ctx
            .clusters
            .remote_clusters(self.ctx.me.cluster())
            .is_empty()
        {
            match self.ctx.partition.take_ownership(
                &address.grain,
                address.activation,
                ActivationStatus::Owned,
            ) {
                Ok(true) => return,
                Ok(false) => {}
                Err(error) => {
                    warn!(grain = %address.grain, %error, "could not take ownership");
                    return;
                }
            }
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.ctx
            .providers
            .task()
            .spawn_task("creation_protocol", async move {
                let grain = address.grain.clone();
                match this.creation_protocol(address).await {
                    Ok(()) => {}
                    Err(DirectoryError::GrainNotFound { .. }) | Err(DirectoryError::Stopping) => {
                        debug!(grain = %grain, "creation protocol abandoned")
                    }
                    Err(error) => warn!(grain = %grain, %error, "creation protocol failed"),
                }
            });
    }

    async fn creation_protocol(&self, address: ActivationAddress) -> Result<(), DirectoryError> {
        let grain = &address.grain;
        loop {
            if !self.ctx.is_running() {
                return Err(DirectoryError::Stopping);
            }
            let clusters = self.ctx.clusters.remote_clusters(self.ctx.me.cluster());
            let responses = join_all(
                clusters
                    .iter()
                    .map(|cluster| self.ask_cluster(*cluster, grain)),
            )
            .await;

            let mut all_answered = true;
            let mut refused = false;
            let mut winner = None;
            for (cluster, response) in clusters.iter().zip(responses) {
                match response {
                    Ok(response) if response.status == ActivationResponseStatus::Failed => {
                        refused = true;
                        if winner.is_none() {
                            winner = response.winner;
                        }
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!(grain = %grain, cluster = %cluster, %error, "cluster did not answer");
                        all_answered = false;
                    }
                }
            }

            if let Some(winner) = winner {
                if winner.node.is_same_cluster(&self.ctx.me) {
                    return Err(DirectoryError::invariant(
                        grain,
                        format!("remote winner {winner} is hosted in the local cluster"),
                    ));
                }
                info!(grain = %grain, winner = %winner, "another cluster owns the grain");
                self.ctx.partition.cache_address(
                    grain,
                    winner.activation,
                    winner.node.clone(),
                    address.activation,
                )?;
                self.ctx.deactivator.deactivate_activations(vec![address]);
                return Ok(());
            }

            if !refused {
                let status = if all_answered {
                    ActivationStatus::Owned
                } else {
                    ActivationStatus::Doubtful
                };
                if self
                    .ctx
                    .partition
                    .take_ownership(grain, address.activation, status)?
                {
                    debug!(grain = %grain, %status, "creation protocol concluded");
                    return Ok(());
                }
                debug!(grain = %grain, "lost a race while asking, retrying");
            }
            self.ctx
                .sleep(self.ctx.config.activation_race_delay())
                .await;
        }
    }

    async fn ask_cluster(
        &self,
        cluster: ClusterId,
        grain: &GrainId,
    ) -> Result<ActivationResponse, DirectoryError> {
        let gateway = self
            .ctx
            .clusters
            .gateway(cluster)
            .ok_or(DirectoryError::ClusterUnavailable { cluster })?;
        let call = gateway.process_activation_request(grain.clone(), self.ctx.me.cluster());
        match self
            .ctx
            .providers
            .time()
            .timeout(self.ctx.config.call_timeout(), call)
            .await
        {
            Ok(result) => result,
            Err(_) => Err(DirectoryError::ClusterUnavailable { cluster }),
        }
    }

    /// Gather this cluster's doubtful activations, settle them against every
    /// other cluster, and tell each node the outcome.
    ///
    /// Winners are only confirmed when every other cluster answered.
    pub async fn reconcile_doubtful_activations(&self) -> Result<(), DirectoryError> {
        let members = self.ctx.ring.borrow().members().to_vec();
        let mut by_node: HashMap<NodeAddress, DoubtfulSet> = HashMap::new();
        for node in members {
            let doubtful = if node == self.ctx.me {
                self.ctx.partition.get_doubtful_activations()
            } else {
                match self.ctx.peer(&node) {
                    Ok(peer) => match self.ctx.call(&node, peer.get_doubtful_activations()).await {
                        Ok(doubtful) => doubtful,
                        Err(error) => {
                            warn!(node = %node, %error, "could not collect doubtful activations");
                            continue;
                        }
                    },
                    Err(error) => {
                        warn!(node = %node, %error, "could not collect doubtful activations");
                        continue;
                    }
                }
            };
            if !doubtful.is_empty() {
                by_node.insert(node, doubtful);
            }
        }
        if by_node.is_empty() {
            return Ok(());
        }

        let all: DoubtfulSet = by_node
            .values()
            .flat_map(|set| set.iter().map(|(a, g)| (*a, g.clone())))
            .collect();
        let clusters = self.ctx.clusters.remote_clusters(self.ctx.me.cluster());
        let mut losers = DoubtfulSet::new();
        let mut all_successful = true;
        for cluster in clusters {
            let Some(gateway) = self.ctx.clusters.gateway(cluster) else {
                all_successful = false;
                continue;
            };
            match gateway
                .process_remote_doubtful_activations(all.clone(), self.ctx.me.cluster())
                .await
            {
                Ok((cluster_losers, complete)) => {
                    all_successful &= complete;
                    losers.extend(cluster_losers);
                }
                Err(error) => {
                    debug!(cluster = %cluster, %error, "anti-entropy request failed");
                    all_successful = false;
                }
            }
        }
        info!(
            node = %self.ctx.me,
            doubtful = all.len(),
            losers = losers.len(),
            all_successful,
            "anti-entropy round"
        );

        for (node, doubtful) in by_node {
            let node_losers: DoubtfulSet = doubtful
                .iter()
                .filter(|(activation, _)| losers.contains_key(*activation))
                .map(|(a, g)| (*a, g.clone()))
                .collect();
            let node_winners: Option<DoubtfulSet> = all_successful.then(|| {
                doubtful
                    .iter()
                    .filter(|(activation, _)| !losers.contains_key(*activation))
                    .map(|(a, g)| (*a, g.clone()))
                    .collect()
            });
            let node_losers = (!node_losers.is_empty()).then_some(node_losers);
            if node == self.ctx.me {
                self.apply_anti_entropy_results(node_losers.as_ref(), node_winners.as_ref());
                continue;
            }
            let result = match self.ctx.peer(&node) {
                Ok(peer) => {
                    self.ctx
                        .call(
                            &node,
                            peer.process_anti_entropy_results(node_losers, node_winners),
                        )
                        .await
                }
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                warn!(node = %node, %error, "could not deliver anti-entropy results");
            }
        }
        Ok(())
    }

    /// Periodic anti-entropy; exits when `shutdown` flips to `true` or its
    /// sender is dropped.
    pub(crate) async fn run_anti_entropy(
        self: Rc<Self>,
        period: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.ctx.sleep(period) => {
                    if let Err(error) = self.reconcile_doubtful_activations().await {
                        warn!(node = %self.ctx.me, %error, "anti-entropy round failed");
                    }
                }
            }
        }
    }

    fn apply_anti_entropy_results(
        &self,
        losers: Option<&DoubtfulSet>,
        winners: Option<&DoubtfulSet>,
    ) {
        for address in self
            .ctx
            .partition
            .process_anti_entropy_results(losers, winners)
        {
            self.start_creation_protocol(address);
        }
    }

    fn lookup_local(&self, grain: &GrainId) -> LookupResult {
        match self.ctx.partition.lookup(grain) {
            Some((activations, tag)) => LookupResult {
                activations: self.ctx.valid_only(activations),
                version_tag: Some(tag),
            },
            None => LookupResult::default(),
        }
    }

    fn transfer_single_local(&self, address: ActivationAddress, status: ActivationStatus) {
        let registered = self.ctx.partition.transfer_single_activation(
            &address.grain,
            address.activation,
            address.node.clone(),
            status,
        );
        let pending = matches!(
            status,
            ActivationStatus::RequestedOwnership | ActivationStatus::RaceLoser
        );
        if pending && registered == address {
            self.start_creation_protocol(address);
        }
    }
}

#[async_trait(?Send)]
impl<P: Providers> DirectoryPeer for RemoteGrainDirectory<P> {
    async fn register(
        &self,
        address: ActivationAddress,
        retries: u32,
    ) -> Result<ActivationAddress, DirectoryError> {
        match self.route(&address.grain, retries).await? {
            Route::Local => {
                self.ctx
                    .partition
                    .add_activation(&address.grain, address.activation, address.node)
            }
            Route::Forward { owner, retries } => {
                let peer = self.ctx.peer(&owner)?;
                self.ctx.call(&owner, peer.register(address, retries)).await
            }
        }
    }

    async fn register_single_activation(
        &self,
        address: ActivationAddress,
        retries: u32,
    ) -> Result<ActivationAddress, DirectoryError> {
        match self.route(&address.grain, retries).await? {
            Route::Local => Ok(self.register_single_local(address)),
            Route::Forward { owner, retries } => {
                let peer = self.ctx.peer(&owner)?;
                self.ctx
                    .call(&owner, peer.register_single_activation(address, retries))
                    .await
            }
        }
    }

    async fn register_many(
        &self,
        addresses: Vec<ActivationAddress>,
        retries: u32,
    ) -> Result<(), DirectoryError> {
        let (local, forward) = self
            .route_many(addresses, |address| &address.grain, retries)
            .await?;
        for address in local {
            self.ctx
                .partition
                .add_activation(&address.grain, address.activation, address.node)?;
        }
        for (owner, batch) in forward {
            let peer = self.ctx.peer(&owner)?;
            self.ctx
                .call(&owner, peer.register_many(batch, retries - 1))
                .await?;
        }
        Ok(())
    }

    async fn register_many_single_activation(
        &self,
        addresses: Vec<(ActivationAddress, ActivationStatus)>,
        retries: u32,
    ) -> Result<(), DirectoryError> {
        let (local, forward) = self
            .route_many(addresses, |(address, _)| &address.grain, retries)
            .await?;
        debug!(node = %self.ctx.me, count = local.len(), "taking over single activations");
        for (address, status) in local {
            self.transfer_single_local(address, status);
        }
        for (owner, batch) in forward {
            let peer = self.ctx.peer(&owner)?;
            self.ctx
                .call(
                    &owner,
                    peer.register_many_single_activation(batch, retries - 1),
                )
                .await?;
        }
        Ok(())
    }

    async fn unregister(
        &self,
        address: ActivationAddress,
        force: bool,
        retries: u32,
    ) -> Result<(), DirectoryError> {
        match self.route(&address.grain, retries).await? {
            Route::Local => {
                self.ctx
                    .partition
                    .remove_activation(&address.grain, &address.activation, force);
                Ok(())
            }
            Route::Forward { owner, retries } => {
                let peer = self.ctx.peer(&owner)?;
                self.ctx
                    .call(&owner, peer.unregister(address, force, retries))
                    .await
            }
        }
    }

    async fn unregister_many(
        &self,
        addresses: Vec<ActivationAddress>,
        retries: u32,
    ) -> Result<(), DirectoryError> {
        let (local, forward) = self
            .route_many(addresses, |address| &address.grain, retries)
            .await?;
        for address in local {
            self.ctx
                .partition
                .remove_activation(&address.grain, &address.activation, true);
        }
        for (owner, batch) in forward {
            let peer = self.ctx.peer(&owner)?;
            self.ctx
                .call(&owner, peer.unregister_many(batch, retries - 1))
                .await?;
        }
        Ok(())
    }

    async fn delete_grain(&self, grain: GrainId, retries: u32) -> Result<(), DirectoryError> {
        match self.route(&grain, retries).await? {
            Route::Local => {
                self.ctx.partition.remove_grain(&grain);
                Ok(())
            }
            Route::Forward { owner, retries } => {
                let peer = self.ctx.peer(&owner)?;
                self.ctx
                    .call(&owner, peer.delete_grain(grain, retries))
                    .await
            }
        }
    }

    async fn lookup(&self, grain: GrainId, retries: u32) -> Result<LookupResult, DirectoryError> {
        match self.route(&grain, retries).await? {
            Route::Local => Ok(self.lookup_local(&grain)),
            Route::Forward { owner, retries } => {
                let peer = self.ctx.peer(&owner)?;
                self.ctx.call(&owner, peer.lookup(grain, retries)).await
            }
        }
    }

    async fn lookup_many(
        &self,
        grains: Vec<(GrainId, VersionTag)>,
    ) -> Result<Vec<LookupManyEntry>, DirectoryError> {
        Ok(grains
            .into_iter()
            .map(|(grain, cached)| match self.ctx.partition.lookup(&grain) {
                None => LookupManyEntry {
                    grain,
                    version_tag: None,
                    activations: None,
                },
                Some((_, tag)) if tag == cached => LookupManyEntry {
                    grain,
                    version_tag: Some(tag),
                    activations: None,
                },
                Some((activations, tag)) => LookupManyEntry {
                    grain,
                    version_tag: Some(tag),
                    activations: Some(self.ctx.valid_only(activations)),
                },
            })
            .collect())
    }

    async fn register_replica(
        &self,
        source: NodeAddress,
        chunk: PartitionDelta,
        is_full: bool,
    ) -> Result<(), DirectoryError> {
        self.replication
            .register_replica(source, chunk, is_full)
            .await;
        Ok(())
    }

    async fn unregister_replica(&self, source: NodeAddress) -> Result<(), DirectoryError> {
        self.replication.unregister_replica(&source).await;
        Ok(())
    }

    async fn process_activation_request(
        &self,
        grain: GrainId,
        requesting: ClusterId,
        retries: u32,
    ) -> Result<ActivationResponse, DirectoryError> {
        match self.route(&grain, retries).await? {
            Route::Local => self.ctx.partition.grain_status_response(&grain, requesting),
            Route::Forward { owner, retries } => {
                let peer = self.ctx.peer(&owner)?;
                self.ctx
                    .call(
                        &owner,
                        peer.process_activation_request(grain, requesting, retries),
                    )
                    .await
            }
        }
    }

    async fn get_doubtful_activations(&self) -> Result<DoubtfulSet, DirectoryError> {
        Ok(self.ctx.partition.get_doubtful_activations())
    }

    async fn find_loser_doubtful_activations(
        &self,
        remote: DoubtfulSet,
        sender: ClusterId,
    ) -> Result<DoubtfulSet, DirectoryError> {
        let (local_losers, remote_losers) = self
            .ctx
            .partition
            .resolve_doubtful_activations(remote, sender)?;
        for address in local_losers {
            self.start_creation_protocol(address);
        }
        Ok(remote_losers)
    }

    async fn process_anti_entropy_results(
        &self,
        losers: Option<DoubtfulSet>,
        winners: Option<DoubtfulSet>,
    ) -> Result<(), DirectoryError> {
        self.apply_anti_entropy_results(losers.as_ref(), winners.as_ref());
        Ok(())
    }
}

#[async_trait(?Send)]
impl<P: Providers> ClusterGateway for RemoteGrainDirectory<P> {
    async fn process_activation_request(
        &self,
        grain: GrainId,
        requesting: ClusterId,
    ) -> Result<ActivationResponse, DirectoryError> {
        DirectoryPeer::process_activation_request(
            self,
            grain,
            requesting,
            self.ctx.config.retries(),
        )
        .await
    }

    async fn process_remote_doubtful_activations(
        &self,
        remote: DoubtfulSet,
        sender: ClusterId,
    ) -> Result<(DoubtfulSet, bool), DirectoryError> {
        let mut by_owner: HashMap<NodeAddress, DoubtfulSet> = HashMap::new();
        for (activation, grain) in remote {
            let owner = self.ctx.owner(&grain)?;
            by_owner.entry(owner).or_default().insert(activation, grain);
        }

        let requests = by_owner.into_iter().map(|(owner, set)| async move {
            if owner == self.ctx.me {
                return (
                    owner.clone(),
                    self.find_loser_doubtful_activations(set, sender).await,
                );
            }
            let result = match self.ctx.peer(&owner) {
                Ok(peer) => {
                    self.ctx
                        .call(&owner, peer.find_loser_doubtful_activations(set, sender))
                        .await
                }
                Err(error) => Err(error),
            };
            (owner, result)
        });

        let mut losers = DoubtfulSet::new();
        let mut all_successful = true;
        for (owner, result) in join_all(requests).await {
            match result {
                Ok(found) => losers.extend(found),
                Err(error) => {
                    warn!(owner = %owner, %error, "owner did not resolve doubtful activations");
                    all_successful = false;
                }
            }
        }
        Ok((losers, all_successful))
    }
}
