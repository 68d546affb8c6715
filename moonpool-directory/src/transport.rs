//! Peer network: how one directory node calls another.
//!
//! The directory never frames messages itself. A host plugs its RPC layer
//! in behind two traits:
//!
//! - [`PeerNetwork`] resolves a node of the local cluster to a
//!   [`DirectoryPeer`], the per-node RPC surface.
//! - [`MultiClusterNetwork`] resolves a remote cluster to the
//!   [`ClusterGateway`] of its gateway node.
//!
//! [`LocalPeerNetwork`] and [`LocalClusterNetwork`] route calls in-process,
//! which is what simulations and integration tests use. Both can cut a
//! target off to simulate a network partition.
//!
//! Every `retries` argument is the remaining forward budget: a receiver
//! that is not the owner waits `retry_delay` and forwards with
//! `retries - 1`, failing with [`DirectoryError::NotOwner`] at zero.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

use async_trait::async_trait;
use tracing::debug;

use crate::error::DirectoryError;
use crate::partition::{ActivationResponse, ActivationStatus, DoubtfulSet, PartitionDelta};
use crate::types::{ActivationAddress, ClusterId, GrainId, NodeAddress, VersionTag};

/// Answer to a remote lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupResult {
    /// Activations on valid nodes.
    pub activations: Vec<ActivationAddress>,
    /// Tag of the owner's entry; `None` when the grain is unknown.
    pub version_tag: Option<VersionTag>,
}

/// One answer of a batched revalidation.
///
/// | `version_tag` | `activations` | meaning |
/// |---|---|---|
/// | `None` | `None` | the owner has no entry |
/// | `Some(t)` | `None` | unchanged since the caller's tag |
/// | `Some(t)` | `Some(a)` | changed; `a` is current |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupManyEntry {
    /// The grain asked about.
    pub grain: GrainId,
    /// Current tag of the owner's entry.
    pub version_tag: Option<VersionTag>,
    /// Current activations, only when the tag changed.
    pub activations: Option<Vec<ActivationAddress>>,
}

/// RPC surface of one directory node, as seen by its peers.
#[async_trait(?Send)]
pub trait DirectoryPeer {
    /// Register a multi-activation instance.
    async fn register(
        &self,
        address: ActivationAddress,
        retries: u32,
    ) -> Result<ActivationAddress, DirectoryError>;

    /// Register the single activation of a grain. Returns the winner, which
    /// may be a pre-existing activation.
    async fn register_single_activation(
        &self,
        address: ActivationAddress,
        retries: u32,
    ) -> Result<ActivationAddress, DirectoryError>;

    /// Register a batch of multi-activation instances.
    async fn register_many(
        &self,
        addresses: Vec<ActivationAddress>,
        retries: u32,
    ) -> Result<(), DirectoryError>;

    /// Take over single activations from their previous owner, keeping
    /// each one's protocol status.
    async fn register_many_single_activation(
        &self,
        addresses: Vec<(ActivationAddress, ActivationStatus)>,
        retries: u32,
    ) -> Result<(), DirectoryError>;

    /// Remove one activation.
    async fn unregister(
        &self,
        address: ActivationAddress,
        force: bool,
        retries: u32,
    ) -> Result<(), DirectoryError>;

    /// Remove a batch of activations.
    async fn unregister_many(
        &self,
        addresses: Vec<ActivationAddress>,
        retries: u32,
    ) -> Result<(), DirectoryError>;

    /// Remove a grain and every activation it has.
    async fn delete_grain(&self, grain: GrainId, retries: u32) -> Result<(), DirectoryError>;

    /// Look a grain up on its owner.
    async fn lookup(&self, grain: GrainId, retries: u32) -> Result<LookupResult, DirectoryError>;

    /// Revalidate cached entries against their tags. Answered from the
    /// local partition only.
    async fn lookup_many(
        &self,
        grains: Vec<(GrainId, VersionTag)>,
    ) -> Result<Vec<LookupManyEntry>, DirectoryError>;

    /// Store a chunk of `source`'s partition. `is_full` replaces the
    /// replica; otherwise the chunk is applied as a delta.
    async fn register_replica(
        &self,
        source: NodeAddress,
        chunk: PartitionDelta,
        is_full: bool,
    ) -> Result<(), DirectoryError>;

    /// Drop the replica held for `source`.
    async fn unregister_replica(&self, source: NodeAddress) -> Result<(), DirectoryError>;

    /// Whether `requesting` may activate `grain`, routed to the owner in
    /// this cluster.
    async fn process_activation_request(
        &self,
        grain: GrainId,
        requesting: ClusterId,
        retries: u32,
    ) -> Result<ActivationResponse, DirectoryError>;

    /// This node's doubtful activations.
    async fn get_doubtful_activations(&self) -> Result<DoubtfulSet, DirectoryError>;

    /// Resolve `remote`'s doubtful activations against this node's
    /// partition. Returns the remote losers.
    async fn find_loser_doubtful_activations(
        &self,
        remote: DoubtfulSet,
        sender: ClusterId,
    ) -> Result<DoubtfulSet, DirectoryError>;

    /// Apply the outcome of an anti-entropy round.
    async fn process_anti_entropy_results(
        &self,
        losers: Option<DoubtfulSet>,
        winners: Option<DoubtfulSet>,
    ) -> Result<(), DirectoryError>;
}

/// Cross-cluster surface exposed by a cluster's gateway node.
#[async_trait(?Send)]
pub trait ClusterGateway {
    /// Ask this cluster whether `requesting` may activate `grain`.
    async fn process_activation_request(
        &self,
        grain: GrainId,
        requesting: ClusterId,
    ) -> Result<ActivationResponse, DirectoryError>;

    /// Resolve another cluster's doubtful activations against this cluster.
    /// Returns the remote losers and whether every local owner answered.
    async fn process_remote_doubtful_activations(
        &self,
        remote: DoubtfulSet,
        sender: ClusterId,
    ) -> Result<(DoubtfulSet, bool), DirectoryError>;
}

/// Resolves nodes of the local cluster to their directory.
pub trait PeerNetwork: fmt::Debug {
    /// The directory of `node`, or `None` if it cannot be reached.
    fn peer(&self, node: &NodeAddress) -> Option<Rc<dyn DirectoryPeer>>;
}

/// Resolves other clusters to their gateway.
pub trait MultiClusterNetwork: fmt::Debug {
    /// Every known cluster other than `local`.
    fn remote_clusters(&self, local: ClusterId) -> Vec<ClusterId>;

    /// The gateway of `cluster`, or `None` if it cannot be reached.
    fn gateway(&self, cluster: ClusterId) -> Option<Rc<dyn ClusterGateway>>;
}

/// Single-cluster deployment: there is never anyone to ask.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemoteClusters;

impl MultiClusterNetwork for NoRemoteClusters {
    fn remote_clusters(&self, _local: ClusterId) -> Vec<ClusterId> {
        Vec::new()
    }

    fn gateway(&self, _cluster: ClusterId) -> Option<Rc<dyn ClusterGateway>> {
        None
    }
}

/// In-process routing table between directory nodes.
///
/// Nodes are held weakly, so a dropped directory simply becomes
/// unreachable.
#[derive(Default)]
pub struct LocalPeerNetwork {
    peers: RefCell<HashMap<NodeAddress, Weak<dyn DirectoryPeer>>>,
    unreachable: RefCell<HashSet<NodeAddress>>,
}

impl fmt::Debug for LocalPeerNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPeerNetwork")
            .field("peers", &self.peers.borrow().len())
            .field("unreachable", &self.unreachable.borrow())
            .finish()
    }
}

impl LocalPeerNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls for `node` to `peer`.
    pub fn register(&self, node: NodeAddress, peer: Weak<dyn DirectoryPeer>) {
        self.peers.borrow_mut().insert(node, peer);
    }

    /// Forget `node`.
    pub fn deregister(&self, node: &NodeAddress) {
        self.peers.borrow_mut().remove(node);
    }

    /// Make `node` unreachable until [`LocalPeerNetwork::heal`].
    pub fn partition(&self, node: NodeAddress) {
        debug!(node = %node, "partitioning node");
        self.unreachable.borrow_mut().insert(node);
    }

    /// Make `node` reachable again.
    pub fn heal(&self, node: &NodeAddress) {
        self.unreachable.borrow_mut().remove(node);
    }
}

impl PeerNetwork for LocalPeerNetwork {
    fn peer(&self, node: &NodeAddress) -> Option<Rc<dyn DirectoryPeer>> {
        if self.unreachable.borrow().contains(node) {
            return None;
        }
        self.peers.borrow().get(node).and_then(Weak::upgrade)
    }
}

/// In-process routing table between cluster gateways.
#[derive(Default)]
pub struct LocalClusterNetwork {
    gateways: RefCell<HashMap<ClusterId, Weak<dyn ClusterGateway>>>,
    unreachable: RefCell<HashSet<ClusterId>>,
}

impl fmt::Debug for LocalClusterNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut clusters: Vec<ClusterId> = self.gateways.borrow().keys().copied().collect();
        clusters.sort();
        f.debug_struct("LocalClusterNetwork")
            .field("clusters", &clusters)
            .field("unreachable", &self.unreachable.borrow())
            .finish()
    }
}

impl LocalClusterNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `gateway` the entry point of `cluster`.
    pub fn register(&self, cluster: ClusterId, gateway: Weak<dyn ClusterGateway>) {
        self.gateways.borrow_mut().insert(cluster, gateway);
    }

    /// Cut `cluster` off from every other cluster.
    pub fn partition(&self, cluster: ClusterId) {
        debug!(cluster = %cluster, "partitioning cluster");
        self.unreachable.borrow_mut().insert(cluster);
    }

    /// Reconnect `cluster`.
    pub fn heal(&self, cluster: ClusterId) {
        self.unreachable.borrow_mut().remove(&cluster);
    }
}

impl MultiClusterNetwork for LocalClusterNetwork {
    fn remote_clusters(&self, local: ClusterId) -> Vec<ClusterId> {
        let mut clusters: Vec<ClusterId> = self
            .gateways
            .borrow()
            .keys()
            .copied()
            .filter(|cluster| *cluster != local)
            .collect();
        clusters.sort();
        clusters
    }

    fn gateway(&self, cluster: ClusterId) -> Option<Rc<dyn ClusterGateway>> {
        if self.unreachable.borrow().contains(&cluster) {
            return None;
        }
        self.gateways.borrow().get(&cluster).and_then(Weak::upgrade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::ActivationResponseStatus;

    struct PassGateway;

    #[async_trait(?Send)]
    impl ClusterGateway for PassGateway {
        async fn process_activation_request(
            &self,
            _grain: GrainId,
            _requesting: ClusterId,
        ) -> Result<ActivationResponse, DirectoryError> {
            Ok(ActivationResponse::pass())
        }

        async fn process_remote_doubtful_activations(
            &self,
            _remote: DoubtfulSet,
            _sender: ClusterId,
        ) -> Result<(DoubtfulSet, bool), DirectoryError> {
            Ok((DoubtfulSet::new(), true))
        }
    }

    #[tokio::test]
    async fn test_cluster_network_routing() {
        let network = LocalClusterNetwork::new();
        let gateway: Rc<dyn ClusterGateway> = Rc::new(PassGateway);
        network.register(ClusterId(0), Rc::downgrade(&gateway));
        network.register(ClusterId(1), Rc::downgrade(&gateway));
        network.register(ClusterId(2), Rc::downgrade(&gateway));

        assert_eq!(
            network.remote_clusters(ClusterId(1)),
            vec![ClusterId(0), ClusterId(2)]
        );

        let response = network
            .gateway(ClusterId(2))
            .expect("reachable")
            .process_activation_request(GrainId::new(crate::types::GrainType(1), "g"), ClusterId(0))
            .await
            .expect("answer");
        assert_eq!(response.status, ActivationResponseStatus::Pass);

        network.partition(ClusterId(2));
        assert!(network.gateway(ClusterId(2)).is_none());
        network.heal(ClusterId(2));
        assert!(network.gateway(ClusterId(2)).is_some());
    }

    #[test]
    fn test_dropped_gateway_is_unreachable() {
        let network = LocalClusterNetwork::new();
        {
            let gateway: Rc<dyn ClusterGateway> = Rc::new(PassGateway);
            network.register(ClusterId(0), Rc::downgrade(&gateway));
        }
        assert!(network.gateway(ClusterId(0)).is_none());
        assert!(NoRemoteClusters.remote_clusters(ClusterId(0)).is_empty());
    }
}
