//! State shared by the components of one directory node.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use crate::cache::DirectoryCache;
use crate::catalog::ActivationDeactivator;
use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use crate::membership::MembershipView;
use crate::partition::DirectoryPartition;
use crate::providers::{Providers, TimeError, TimeProvider};
use crate::ring::RingPartitioner;
use crate::transport::{DirectoryPeer, MultiClusterNetwork, PeerNetwork};
use crate::types::{ActivationAddress, GrainId, NodeAddress};

/// Everything the facade, the remote handler, the replication agent and
/// the cache maintainer of one node have in common.
pub(crate) struct DirectoryContext<P: Providers> {
    pub(crate) me: NodeAddress,
    pub(crate) config: DirectoryConfig,
    pub(crate) providers: P,
    pub(crate) ring: RefCell<RingPartitioner>,
    pub(crate) partition: DirectoryPartition,
    pub(crate) cache: RefCell<Box<dyn DirectoryCache>>,
    pub(crate) membership: Rc<dyn MembershipView>,
    pub(crate) network: Rc<dyn PeerNetwork>,
    pub(crate) clusters: Rc<dyn MultiClusterNetwork>,
    pub(crate) deactivator: Rc<dyn ActivationDeactivator>,
}

impl<P: Providers> DirectoryContext<P> {
    /// Directory owner of `grain`, skipping this node while it stops.
    pub(crate) fn owner(&self, grain: &GrainId) -> Result<NodeAddress, DirectoryError> {
        self.ring
            .borrow()
            .calculate_owner(grain, true)?
            .ok_or(DirectoryError::Stopping)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.ring.borrow().is_running()
    }

    /// Nodes of other clusters are trusted; local ones must be alive.
    pub(crate) fn is_valid(&self, node: &NodeAddress) -> bool {
        !node.is_same_cluster(&self.me) || self.membership.is_valid(node)
    }

    pub(crate) fn valid_only(&self, addresses: Vec<ActivationAddress>) -> Vec<ActivationAddress> {
        addresses
            .into_iter()
            .filter(|address| self.is_valid(&address.node))
            .collect()
    }

    pub(crate) fn peer(&self, node: &NodeAddress) -> Result<Rc<dyn DirectoryPeer>, DirectoryError> {
        self.network
            .peer(node)
            .ok_or_else(|| DirectoryError::PeerUnavailable { node: node.clone() })
    }

    /// Run a call to `node` under the configured call timeout.
    pub(crate) async fn call<T, F>(&self, node: &NodeAddress, call: F) -> Result<T, DirectoryError>
    where
        F: Future<Output = Result<T, DirectoryError>>,
    {
        match self
            .providers
            .time()
            .timeout(self.config.call_timeout(), call)
            .await
        {
            Ok(result) => result,
            Err(TimeError::Elapsed) => Err(DirectoryError::Timeout { node: node.clone() }),
        }
    }

    pub(crate) async fn sleep(&self, duration: std::time::Duration) {
        self.providers.time().sleep(duration).await;
    }
}
