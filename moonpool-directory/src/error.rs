//! Error types for the grain directory.

use thiserror::Error;

use crate::types::{ClusterId, GrainId, NodeAddress};

/// Errors surfaced by directory operations.
///
/// `Stopping` and `InvariantViolation` are never retried. `NotOwner` is what
/// a caller sees once the retry budget for a stale ring view is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// No owner can be computed because this node is stopping and is the
    /// only member left in its ring view.
    #[error("grain directory is stopping")]
    Stopping,

    /// This node does not own the grain and the retry budget is spent.
    #[error("node {node} is not the owner of grain {grain} (owner is {owner})")]
    NotOwner {
        /// The grain being routed.
        grain: GrainId,
        /// The owner computed by the last attempt.
        owner: NodeAddress,
        /// The node that gave up.
        node: NodeAddress,
    },

    /// The owner computed for a grain is not a valid member.
    #[error("ring at {node} is not stable enough to route grain {grain} to {owner}")]
    UnstableRing {
        /// The grain being routed.
        grain: GrainId,
        /// The owner that failed validation.
        owner: NodeAddress,
        /// The node doing the routing.
        node: NodeAddress,
    },

    /// The grain has no entry in the partition, typically because it was
    /// handed off to another node.
    #[error("grain {grain} is not in this directory partition")]
    GrainNotFound {
        /// The missing grain.
        grain: GrainId,
    },

    /// A state machine transition that must never happen.
    #[error("invariant violation for grain {grain}: {reason}")]
    InvariantViolation {
        /// The grain whose entry is inconsistent.
        grain: GrainId,
        /// What went wrong.
        reason: String,
    },

    /// The precedence function was called with an unset cluster id.
    #[error("invalid cluster id {cluster}")]
    InvalidClusterId {
        /// The offending id.
        cluster: ClusterId,
    },

    /// A well-known grain needs the seed node, but none is configured.
    #[error("grain {grain} must live on the seed node, but no seed node is configured")]
    MissingSeed {
        /// The well-known grain.
        grain: GrainId,
    },

    /// No route to the peer directory.
    #[error("directory on {node} is unreachable")]
    PeerUnavailable {
        /// The unreachable node.
        node: NodeAddress,
    },

    /// No route to the gateway of a remote cluster.
    #[error("cluster {cluster} is unreachable")]
    ClusterUnavailable {
        /// The unreachable cluster.
        cluster: ClusterId,
    },

    /// A call to a peer did not complete in time.
    #[error("call to {node} timed out")]
    Timeout {
        /// The slow node.
        node: NodeAddress,
    },
}

impl DirectoryError {
    pub(crate) fn invariant(grain: &GrainId, reason: impl Into<String>) -> Self {
        let error = DirectoryError::InvariantViolation {
            grain: grain.clone(),
            reason: reason.into(),
        };
        tracing::error!(%error, "directory invariant violated");
        error
    }
}

/// Errors raised while assembling a directory or its configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DirectoryConfigError {
    /// The cache growth factor must be finite and must not shrink the timer.
    #[error("cache TTL growth factor must be a finite value >= 1.0, got {0}")]
    InvalidGrowthFactor(f64),

    /// The initial cache TTL exceeds the maximum.
    #[error("initial cache TTL exceeds the maximum TTL")]
    InitialTtlAboveMax,

    /// Replication chunks must hold at least one entry.
    #[error("replication chunk size must be > 0")]
    EmptyReplicationChunk,

    /// A membership view is required.
    #[error("a membership view is required")]
    MissingMembership,

    /// A peer network is required.
    #[error("a peer network is required")]
    MissingNetwork,

    /// An activation deactivator is required.
    #[error("an activation deactivator is required")]
    MissingDeactivator,
}
