//! # Moonpool Directory
//!
//! Partitioned, replicated grain directory for moonpool virtual actors.
//!
//! Every node of a cluster owns the directory entries of the grains whose
//! hash falls in its range of a consistent hash ring. The directory maps a
//! grain to the activations currently hosting it and guarantees, for
//! single-activation grains, that at most one activation wins, across
//! clusters included.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 LocalGrainDirectory (facade)                 │
//! │   route to owner · two-tier lookup · membership listener     │
//! ├──────────────────┬────────────────────┬──────────────────────┤
//! │ RingPartitioner  │ DirectoryPartition │ DirectoryCache       │
//! │ owner, successors│ owned entries      │ LRU or adaptive TTL  │
//! ├──────────────────┴────────────────────┴──────────────────────┤
//! │ RemoteGrainDirectory: RPC surface for peers and gateways     │
//! │   creation protocol · anti-entropy · replica handling        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Replication agent · cache maintainer (background tasks)      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Providers (time, task) · PeerNetwork · MultiClusterNetwork   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one thread: state lives behind `Rc`/`RefCell` and
//! background work is spawned with [`TaskProvider::spawn_task`], so the
//! Tokio providers need a [`tokio::task::LocalSet`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::rc::Rc;
//! use moonpool_directory::{
//!     DirectoryConfig, LocalGrainDirectory, LocalPeerNetwork, RecordingDeactivator,
//!     SharedMembership, TokioProviders,
//! };
//!
//! let membership = Rc::new(SharedMembership::with_active([me.clone()]));
//! let network = Rc::new(LocalPeerNetwork::new());
//! let directory = LocalGrainDirectory::builder(me.clone(), DirectoryConfig::default(), TokioProviders::new())
//!     .membership(membership.clone())
//!     .network(network.clone())
//!     .deactivator(Rc::new(RecordingDeactivator::new()))
//!     .build()?;
//! network.register(me, Rc::downgrade(&directory.peer()));
//! membership.subscribe(directory.listener());
//! directory.start();
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod cache;
pub mod catalog;
pub mod config;
mod context;
pub mod directory;
pub mod error;
pub mod membership;
pub mod partition;
pub mod providers;
pub mod remote;
mod replication;
pub mod ring;
pub mod transport;
pub mod types;

pub use cache::{
    create_cache, AdaptiveCache, CachedActivations, DirectoryCache, LruDirectoryCache, NullCache,
};
pub use catalog::{ActivationDeactivator, RecordingDeactivator};
pub use config::{CacheStrategy, DirectoryConfig, DirectoryConfigBuilder};
pub use directory::{LocalGrainDirectory, LocalGrainDirectoryBuilder};
pub use error::{DirectoryConfigError, DirectoryError};
pub use membership::{
    MembershipError, MembershipListener, MembershipView, NodeStatus, SharedMembership,
};
pub use partition::{
    activation_precedence, ActivationInfo, ActivationResponse, ActivationResponseStatus,
    ActivationStatus, DirectoryPartition, DoubtfulSet, GrainInfo, PartitionDelta,
};
pub use providers::{
    Providers, TaskProvider, TimeError, TimeProvider, TokioProviders, TokioTaskProvider,
    TokioTimeProvider,
};
pub use remote::RemoteGrainDirectory;
pub use ring::RingPartitioner;
pub use transport::{
    ClusterGateway, DirectoryPeer, LocalClusterNetwork, LocalPeerNetwork, LookupManyEntry,
    LookupResult, MultiClusterNetwork, NoRemoteClusters, PeerNetwork,
};
pub use types::{
    ActivationAddress, ActivationId, ClusterId, GrainCategory, GrainId, GrainType, NodeAddress,
    VersionTag,
};
