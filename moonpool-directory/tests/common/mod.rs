//! Shared harness: in-process clusters of directory nodes.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use moonpool_directory::{
    ActivationAddress, ActivationId, ActivationStatus, ClusterId, DirectoryConfig, GrainId,
    GrainType, LocalClusterNetwork, LocalGrainDirectory, LocalPeerNetwork, NodeAddress, NodeStatus,
    RecordingDeactivator, SharedMembership, TokioProviders,
};

pub type Directory = Rc<LocalGrainDirectory<TokioProviders>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn node(cluster: ClusterId, port: u16) -> NodeAddress {
    NodeAddress::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        1,
        cluster,
    )
}

pub fn grain(key: &str) -> GrainId {
    GrainId::new(GrainType(7), key)
}

/// Let spawned tasks and timers run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// One cluster: shared membership, peer network and catalog hook.
pub struct TestCluster {
    pub id: ClusterId,
    pub membership: Rc<SharedMembership>,
    pub network: Rc<LocalPeerNetwork>,
    pub deactivator: Rc<RecordingDeactivator>,
    pub nodes: Vec<Directory>,
}

impl TestCluster {
    /// Start `size` nodes on ports `base_port..`.
    pub fn start(id: ClusterId, base_port: u16, size: u16, config: DirectoryConfig) -> Self {
        Self::start_with(id, base_port, size, config, None)
    }

    /// Same as [`TestCluster::start`], with the first node acting as the
    /// cluster's gateway in `clusters`.
    pub fn start_with(
        id: ClusterId,
        base_port: u16,
        size: u16,
        config: DirectoryConfig,
        clusters: Option<Rc<LocalClusterNetwork>>,
    ) -> Self {
        let addresses: Vec<NodeAddress> = (0..size).map(|i| node(id, base_port + i)).collect();
        let membership = Rc::new(SharedMembership::with_active(addresses.clone()));
        let network = Rc::new(LocalPeerNetwork::new());
        let deactivator = Rc::new(RecordingDeactivator::new());

        let nodes: Vec<Directory> = addresses
            .iter()
            .map(|address| {
                let mut builder = LocalGrainDirectory::builder(
                    address.clone(),
                    config.clone(),
                    TokioProviders::new(),
                )
                .membership(membership.clone())
                .network(network.clone())
                .deactivator(deactivator.clone());
                if let Some(clusters) = &clusters {
                    builder = builder.clusters(clusters.clone());
                }
                let directory = builder.build().expect("valid directory");
                network.register(address.clone(), Rc::downgrade(&directory.peer()));
                membership.subscribe(directory.listener());
                directory
            })
            .collect();
        if let (Some(clusters), Some(gateway)) = (&clusters, nodes.first()) {
            clusters.register(id, Rc::downgrade(&gateway.gateway()));
        }
        for directory in &nodes {
            directory.start();
        }

        Self {
            id,
            membership,
            network,
            deactivator,
            nodes,
        }
    }

    /// Start a new node and announce it as active.
    pub fn join(&mut self, port: u16, config: DirectoryConfig) -> Directory {
        let address = node(self.id, port);
        let directory =
            LocalGrainDirectory::builder(address.clone(), config, TokioProviders::new())
                .membership(self.membership.clone())
                .network(self.network.clone())
                .deactivator(self.deactivator.clone())
                .build()
                .expect("valid directory");
        self.network
            .register(address.clone(), Rc::downgrade(&directory.peer()));
        self.membership.subscribe(directory.listener());
        directory.start();
        self.membership.set_status(address, NodeStatus::Active);
        self.nodes.push(directory.clone());
        directory
    }

    pub fn directory(&self, address: &NodeAddress) -> &Directory {
        self.nodes
            .iter()
            .find(|directory| directory.me() == address)
            .expect("node belongs to the cluster")
    }

    /// The directory owning `grain`, as seen by the first node.
    pub fn owner_of(&self, grain: &GrainId) -> &Directory {
        let owner = self.nodes[0]
            .get_primary_for_grain(grain)
            .expect("ring has an owner");
        self.directory(&owner)
    }

    /// Some node other than the owner of `grain`.
    pub fn non_owner_of(&self, grain: &GrainId) -> &Directory {
        let owner = self.owner_of(grain).me().clone();
        self.nodes
            .iter()
            .find(|directory| *directory.me() != owner)
            .expect("cluster has more than one node")
    }

    pub fn activation(&self, grain: &GrainId, host: usize, id: u64) -> ActivationAddress {
        ActivationAddress::new(
            grain.clone(),
            self.nodes[host].me().clone(),
            ActivationId(id),
        )
    }
}

/// Status of `activation` in `directory`'s own partition.
pub fn local_status(
    directory: &Directory,
    grain: &GrainId,
    activation: ActivationId,
) -> Option<ActivationStatus> {
    directory
        .get_local_data_for_grain(grain)
        .and_then(|info| info.instances().get(&activation).map(|a| a.status()))
}
