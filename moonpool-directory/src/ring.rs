//! Consistent-hash ring deciding which node owns which grain.
//!
//! Members are kept sorted by [`NodeAddress::consistent_hash`]. A grain is
//! owned by the first member found walking clockwise from the grain's hash:
//! the member with the smallest position `>=` the grain's hash, wrapping to
//! the lowest member past the end of the ring. Node `N` therefore owns the
//! range `(predecessor(N), N]`, and when `N` leaves, its successor inherits
//! that range. Replicas follow the same direction (see
//! [`crate::replication`]).
//!
//! ```text
//! positions {10, 20, 30}
//!   grain 15 -> 20      grain 25 -> 30      grain 35 -> 10 (wrap)
//! remove 20:
//!   grain 15 -> 30
//! ```
//!
//! # Orleans Reference
//!
//! `LocalGrainDirectory.CalculateTargetSilo`, `FindPredecessors`,
//! `FindSuccessors`.

use tracing::{trace, warn};

use crate::error::DirectoryError;
use crate::types::{GrainCategory, GrainId, NodeAddress};

/// Ring view of one node: the sorted member list plus the few facts about
/// the local node that placement depends on.
#[derive(Debug, Clone)]
pub struct RingPartitioner {
    me: NodeAddress,
    seed: Option<NodeAddress>,
    members: Vec<NodeAddress>,
    running: bool,
}

fn ring_key(node: &NodeAddress) -> (u32, std::net::SocketAddr, u64) {
    (node.consistent_hash(), node.endpoint(), node.generation())
}

impl RingPartitioner {
    /// Create a ring containing only `me`.
    ///
    /// The ring starts in the running state.
    pub fn new(me: NodeAddress, seed: Option<NodeAddress>) -> Self {
        let mut ring = Self {
            me: me.clone(),
            seed,
            members: Vec::new(),
            running: true,
        };
        ring.add_member(me);
        ring
    }

    /// The local node.
    pub fn me(&self) -> &NodeAddress {
        &self.me
    }

    /// Members in ring order.
    pub fn members(&self) -> &[NodeAddress] {
        &self.members
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the ring has no member at all.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `node` is a member.
    pub fn contains(&self, node: &NodeAddress) -> bool {
        self.members.contains(node)
    }

    /// Whether the local node still accepts ownership.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Mark the local node as running or stopping.
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Insert a member at its ring position. Returns `false` if it was
    /// already present.
    pub fn add_member(&mut self, node: NodeAddress) -> bool {
        if self.contains(&node) {
            return false;
        }
        let key = ring_key(&node);
        let index = self.members.partition_point(|m| ring_key(m) < key);
        self.members.insert(index, node);
        true
    }

    /// Remove a member. Returns `false` if it was not present.
    pub fn remove_member(&mut self, node: &NodeAddress) -> bool {
        match self.members.iter().position(|m| m == node) {
            Some(index) => {
                self.members.remove(index);
                true
            }
            None => false,
        }
    }

    /// Compute the directory owner of a grain.
    ///
    /// Returns `Ok(None)` only when the local node is stopping, exclusion is
    /// requested, and no other member is known.
    pub fn calculate_owner(
        &self,
        grain: &GrainId,
        exclude_self_if_stopping: bool,
    ) -> Result<Option<NodeAddress>, DirectoryError> {
        match grain.category() {
            GrainCategory::SystemTarget => Ok(Some(self.me.clone())),
            GrainCategory::WellKnown => match &self.seed {
                Some(seed) => Ok(Some(seed.clone())),
                None => Err(DirectoryError::MissingSeed {
                    grain: grain.clone(),
                }),
            },
            GrainCategory::Application => {
                let owner = self.owner_of_hash(grain.uniform_hash(), exclude_self_if_stopping);
                trace!(
                    me = %self.me,
                    grain = %grain,
                    hash = grain.uniform_hash(),
                    owner = ?owner.as_ref().map(ToString::to_string),
                    "calculated directory owner"
                );
                Ok(owner)
            }
        }
    }

    /// Owner of a raw ring position.
    pub fn owner_of_hash(&self, hash: u32, exclude_self_if_stopping: bool) -> Option<NodeAddress> {
        let exclude_me = exclude_self_if_stopping && !self.running;

        if self.members.is_empty() {
            return if exclude_me {
                None
            } else {
                Some(self.me.clone())
            };
        }

        let mut first = None;
        for member in self
            .members
            .iter()
            .filter(|m| !(exclude_me && **m == self.me))
        {
            if first.is_none() {
                first = Some(member);
            }
            if member.consistent_hash() >= hash {
                return Some(member.clone());
            }
        }
        first.cloned()
    }

    /// Up to `count` members before `node`, nearest first.
    ///
    /// Never includes `node` itself. Empty if `node` is not a member.
    pub fn find_predecessors(&self, node: &NodeAddress, count: usize) -> Vec<NodeAddress> {
        self.walk(node, count, false)
    }

    /// Up to `count` members after `node`, nearest first.
    ///
    /// Never includes `node` itself. Empty if `node` is not a member.
    pub fn find_successors(&self, node: &NodeAddress, count: usize) -> Vec<NodeAddress> {
        self.walk(node, count, true)
    }

    fn walk(&self, node: &NodeAddress, count: usize, forward: bool) -> Vec<NodeAddress> {
        let Some(index) = self.members.iter().position(|m| m == node) else {
            warn!(me = %self.me, node = %node, "ring walk from a node that is not a member");
            return Vec::new();
        };
        let len = self.members.len();
        (1..len)
            .take(count)
            .map(|step| {
                let at = if forward {
                    (index + step) % len
                } else {
                    (index + len - step) % len
                };
                self.members[at].clone()
            })
            .collect()
    }

    /// One line per member with its ring position, for diagnostics.
    pub fn status(&self) -> String {
        self.members
            .iter()
            .map(|m| {
                let marker = if *m == self.me { "*" } else { " " };
                format!("{marker}{m}/{:08x}", m.consistent_hash())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;
    use crate::types::{ClusterId, GrainType};

    fn node(port: u16, position: u32) -> NodeAddress {
        NodeAddress::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            1,
            ClusterId(0),
        )
        .with_consistent_hash(position)
    }

    fn ring_10_20_30() -> (RingPartitioner, NodeAddress, NodeAddress, NodeAddress) {
        let (a, b, c) = (node(1, 10), node(2, 20), node(3, 30));
        let mut ring = RingPartitioner::new(a.clone(), None);
        ring.add_member(c.clone());
        ring.add_member(b.clone());
        (ring, a, b, c)
    }

    #[test]
    fn test_members_sorted_by_position() {
        let (ring, a, b, c) = ring_10_20_30();
        assert_eq!(ring.members(), &[a, b, c]);
    }

    #[test]
    fn test_owner_is_first_member_at_or_after_hash() {
        let (ring, a, b, c) = ring_10_20_30();
        assert_eq!(ring.owner_of_hash(15, true), Some(b.clone()));
        assert_eq!(ring.owner_of_hash(20, true), Some(b));
        assert_eq!(ring.owner_of_hash(25, true), Some(c));
        assert_eq!(ring.owner_of_hash(5, true), Some(a.clone()));
        assert_eq!(ring.owner_of_hash(35, true), Some(a));
    }

    #[test]
    fn test_removing_owner_reassigns_to_next_member() {
        let (mut ring, _a, b, c) = ring_10_20_30();
        assert_eq!(ring.owner_of_hash(15, true), Some(b.clone()));
        assert!(ring.remove_member(&b));
        assert_eq!(ring.owner_of_hash(15, true), Some(c));
    }

    #[test]
    fn test_owner_is_always_a_member() {
        let (mut ring, _a, b, _c) = ring_10_20_30();
        ring.remove_member(&b);
        for hash in (0..40).chain([u32::MAX - 1, u32::MAX]) {
            let owner = ring.owner_of_hash(hash, true).expect("owner");
            assert!(ring.contains(&owner));
            assert_eq!(ring.owner_of_hash(hash, true), Some(owner));
        }
    }

    #[test]
    fn test_stopping_node_excludes_itself() {
        let (mut ring, a, b, _c) = ring_10_20_30();
        ring.set_running(false);

        // a owns 5 while running; once stopping, the next member takes it.
        assert_eq!(ring.owner_of_hash(5, true), Some(b));
        // without exclusion, the ring is unchanged
        assert_eq!(ring.owner_of_hash(5, false), Some(a));
    }

    #[test]
    fn test_stopping_alone_has_no_owner() {
        let me = node(1, 10);
        let mut ring = RingPartitioner::new(me.clone(), None);
        ring.set_running(false);
        assert_eq!(ring.owner_of_hash(99, true), None);
        assert_eq!(ring.owner_of_hash(99, false), Some(me));
    }

    #[test]
    fn test_special_grains() {
        let (ring, a, _b, _c) = ring_10_20_30();
        let system = GrainId::system_target(GrainType(1), "catalog");
        assert_eq!(ring.calculate_owner(&system, true), Ok(Some(a)));

        let membership = GrainId::well_known(GrainType(2), "membership");
        assert!(matches!(
            ring.calculate_owner(&membership, true),
            Err(DirectoryError::MissingSeed { .. })
        ));

        let seed = node(9, 99);
        let pinned = RingPartitioner::new(node(1, 10), Some(seed.clone()));
        assert_eq!(pinned.calculate_owner(&membership, true), Ok(Some(seed)));
    }

    #[test]
    fn test_application_grain_uses_hash() {
        let (ring, ..) = ring_10_20_30();
        let grain = GrainId::new(GrainType(7), "player-42");
        let owner = ring
            .calculate_owner(&grain, true)
            .expect("no seed needed")
            .expect("running");
        assert_eq!(Some(owner), ring.owner_of_hash(grain.uniform_hash(), true));
    }

    #[test]
    fn test_find_successors_and_predecessors() {
        let (mut ring, a, b, c) = ring_10_20_30();
        let d = node(4, 40);
        ring.add_member(d.clone());

        assert_eq!(ring.find_successors(&b, 2), vec![c.clone(), d.clone()]);
        assert_eq!(ring.find_successors(&d, 1), vec![a.clone()]);
        assert_eq!(ring.find_predecessors(&a, 2), vec![d.clone(), c.clone()]);
        // never more than the other members, never the node itself
        assert_eq!(ring.find_successors(&a, 10), vec![b, c, d]);
        assert!(ring.find_predecessors(&node(5, 50), 1).is_empty());
    }

    #[test]
    fn test_add_member_is_idempotent() {
        let (mut ring, _a, b, _c) = ring_10_20_30();
        assert!(!ring.add_member(b));
        assert_eq!(ring.len(), 3);
    }
}
