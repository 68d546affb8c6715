//! Identity types shared by every directory component.
//!
//! # Design
//!
//! - [`GrainId`] is a grain type + string key, tagged with a [`GrainCategory`]
//!   that decides whether ring placement applies at all.
//! - [`NodeAddress`] is a socket address + generation + owning cluster. Its
//!   consistent hash is its position on the directory ring.
//! - [`ActivationAddress`] is the value stored in the directory: which grain,
//!   which activation, on which node.
//!
//! Hashes use 32-bit FNV-1a over a stable byte encoding, so two processes
//! always agree on ring positions.
//!
//! # Orleans Reference
//!
//! `GrainId.GetUniformHashCode()` and `SiloAddress.GetConsistentHashCode()`.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(hash: u32, data: &[u8]) -> u32 {
    data.iter()
        .fold(hash, |h, &byte| (h ^ byte as u32).wrapping_mul(FNV_PRIME))
}

/// Identifies a grain TYPE (the interface a grain implements).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Debug)]
pub struct GrainType(pub u64);

/// How a grain is placed in the directory.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Debug)]
pub enum GrainCategory {
    /// Regular application grain, placed on the ring by hash.
    Application,
    /// Per-node system target; every node owns its own.
    SystemTarget,
    /// Cluster-wide singleton pinned to the seed node (membership table,
    /// reminder table).
    WellKnown,
}

/// Stable identity of a logical actor.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Debug)]
pub struct GrainId {
    grain_type: GrainType,
    key: String,
    category: GrainCategory,
}

impl GrainId {
    /// Create an application grain id.
    pub fn new(grain_type: GrainType, key: impl Into<String>) -> Self {
        Self {
            grain_type,
            key: key.into(),
            category: GrainCategory::Application,
        }
    }

    /// Create a system target id (owned by whichever node asks).
    pub fn system_target(grain_type: GrainType, key: impl Into<String>) -> Self {
        Self {
            grain_type,
            key: key.into(),
            category: GrainCategory::SystemTarget,
        }
    }

    /// Create a well-known singleton grain id (owned by the seed node).
    pub fn well_known(grain_type: GrainType, key: impl Into<String>) -> Self {
        Self {
            grain_type,
            key: key.into(),
            category: GrainCategory::WellKnown,
        }
    }

    /// The grain type.
    pub fn grain_type(&self) -> GrainType {
        self.grain_type
    }

    /// The grain key within its type.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Placement category.
    pub fn category(&self) -> GrainCategory {
        self.category
    }

    /// Whether this is a per-node system target.
    pub fn is_system_target(&self) -> bool {
        self.category == GrainCategory::SystemTarget
    }

    /// Position of this grain on the directory ring.
    pub fn uniform_hash(&self) -> u32 {
        let hash = fnv1a(FNV_OFFSET, &self.grain_type.0.to_le_bytes());
        fnv1a(hash, self.key.as_bytes())
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category {
            GrainCategory::Application => write!(f, "{:x}/{}", self.grain_type.0, self.key),
            GrainCategory::SystemTarget => write!(f, "sys.{:x}/{}", self.grain_type.0, self.key),
            GrainCategory::WellKnown => write!(f, "wk.{:x}/{}", self.grain_type.0, self.key),
        }
    }
}

/// Identity of one physical instantiation of a grain.
///
/// Ordered so that a merge that finds duplicate single-instance activations
/// can deterministically keep the lowest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ActivationId(pub u64);

impl ActivationId {
    /// Create an activation id from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Draw a fresh random activation id.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "act-{:016x}", self.0)
    }
}

/// Identifier of a cluster in a multi-cluster deployment.
///
/// `-1` is reserved for "unset" and rejected by the precedence function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ClusterId(pub i32);

impl ClusterId {
    /// The unset cluster id.
    pub const INVALID: ClusterId = ClusterId(-1);

    /// Whether this id names a real cluster.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Identifies a specific node instance of a specific cluster.
///
/// The `generation` distinguishes restarts at the same socket address.
/// Equality covers every field, so a restarted node is a different member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    endpoint: SocketAddr,
    generation: u64,
    cluster: ClusterId,
    ring_position: u32,
}

impl NodeAddress {
    /// Create a node address; its ring position is derived from the
    /// endpoint and generation.
    pub fn new(endpoint: SocketAddr, generation: u64, cluster: ClusterId) -> Self {
        let hash = fnv1a(FNV_OFFSET, endpoint.to_string().as_bytes());
        let ring_position = fnv1a(hash, &generation.to_le_bytes());
        Self {
            endpoint,
            generation,
            cluster,
            ring_position,
        }
    }

    /// Pin this node to an explicit ring position.
    ///
    /// Simulations use this to lay out a ring deterministically.
    pub fn with_consistent_hash(mut self, position: u32) -> Self {
        self.ring_position = position;
        self
    }

    /// The socket address of this node.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// The generation counter for this node instance.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The cluster this node belongs to.
    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    /// Position of this node on the directory ring.
    pub fn consistent_hash(&self) -> u32 {
        self.ring_position
    }

    /// Whether both nodes belong to the same cluster.
    pub fn is_same_cluster(&self, other: &NodeAddress) -> bool {
        self.cluster == other.cluster
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@gen{}/{}",
            self.endpoint, self.generation, self.cluster
        )
    }
}

/// Full address of a grain activation: identity + location + activation.
///
/// This is what the directory hands out. Comparing activation ids lets a
/// caller detect that the registration it holds has been replaced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationAddress {
    /// The grain this activation belongs to.
    pub grain: GrainId,
    /// The node hosting the activation.
    pub node: NodeAddress,
    /// The activation itself.
    pub activation: ActivationId,
}

impl ActivationAddress {
    /// Create a new activation address.
    pub fn new(grain: GrainId, node: NodeAddress, activation: ActivationId) -> Self {
        Self {
            grain,
            node,
            activation,
        }
    }
}

impl fmt::Display for ActivationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} @ {}", self.grain, self.activation, self.node)
    }
}

/// Opaque change marker of a directory entry.
///
/// Tags are random, not monotonic: they only tell "changed" from
/// "unchanged".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag(pub u32);

impl VersionTag {
    /// Draw a fresh random tag.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
