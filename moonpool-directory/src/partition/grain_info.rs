//! Per-grain directory entry and its activation records.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::{ActivationAddress, ActivationId, GrainId, NodeAddress, VersionTag};

/// Registration status of one activation in the directory.
///
/// ```text
/// RequestedOwnership -> Owned | Doubtful
/// RequestedOwnership -> RaceLoser -> RequestedOwnership
/// RequestedOwnership | RaceLoser -> Cached
/// Doubtful -> Owned | RequestedOwnership
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationStatus {
    /// Registered without the cross-cluster protocol (system activations,
    /// plain multi-activation grains).
    System,
    /// Accepted locally, cross-cluster protocol in progress.
    RequestedOwnership,
    /// Every other cluster agreed: this is the single activation.
    Owned,
    /// Some clusters did not answer; anti-entropy will confirm or revoke.
    Doubtful,
    /// Lost a precedence race while the protocol was running.
    RaceLoser,
    /// Reference to an activation owned by another cluster.
    Cached,
}

impl fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivationStatus::System => "system",
            ActivationStatus::RequestedOwnership => "requested-ownership",
            ActivationStatus::Owned => "owned",
            ActivationStatus::Doubtful => "doubtful",
            ActivationStatus::RaceLoser => "race-loser",
            ActivationStatus::Cached => "cached",
        };
        f.write_str(name)
    }
}

/// Where an activation lives and how far its registration got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationInfo {
    node: NodeAddress,
    created_at: Instant,
    status: ActivationStatus,
}

impl ActivationInfo {
    /// Record an activation created now.
    pub fn new(node: NodeAddress, status: ActivationStatus) -> Self {
        Self {
            node,
            created_at: Instant::now(),
            status,
        }
    }

    /// Hosting node.
    pub fn node(&self) -> &NodeAddress {
        &self.node
    }

    /// Registration time.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current registration status.
    pub fn status(&self) -> ActivationStatus {
        self.status
    }
}

/// Directory entry for one grain.
///
/// Instances are kept ordered by [`ActivationId`] so "the first instance"
/// is well defined and merges pick survivors deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrainInfo {
    instances: BTreeMap<ActivationId, ActivationInfo>,
    version_tag: VersionTag,
    single_instance: bool,
}

impl Default for GrainInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl GrainInfo {
    /// Empty multi-activation entry.
    pub fn new() -> Self {
        Self {
            instances: BTreeMap::new(),
            version_tag: VersionTag(0),
            single_instance: false,
        }
    }

    /// Registered activations.
    pub fn instances(&self) -> &BTreeMap<ActivationId, ActivationInfo> {
        &self.instances
    }

    /// Change marker, refreshed on every mutation.
    pub fn version_tag(&self) -> VersionTag {
        self.version_tag
    }

    /// Whether the grain allows a single activation only.
    pub fn is_single_instance(&self) -> bool {
        self.single_instance
    }

    /// Whether no activation is registered.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// First activation in id order.
    pub fn first(&self) -> Option<(ActivationId, &ActivationInfo)> {
        self.instances.iter().next().map(|(id, info)| (*id, info))
    }

    /// Move `activation` to `status`, refreshing the tag on change.
    pub(crate) fn set_status(&mut self, activation: &ActivationId, status: ActivationStatus) {
        let changed = match self.instances.get_mut(activation) {
            Some(info) if info.status != status => {
                info.status = status;
                true
            }
            _ => false,
        };
        if changed {
            self.touch();
        }
    }

    fn touch(&mut self) {
        self.version_tag = VersionTag::random();
    }

    /// Add (or overwrite) an activation without any conflict check.
    ///
    /// Returns `false` when the grain is single-instance and already holds a
    /// different activation; the entry is left untouched in that case.
    pub(crate) fn add_activation(
        &mut self,
        activation: ActivationId,
        node: NodeAddress,
        status: ActivationStatus,
    ) -> bool {
        if self.single_instance
            && !self.instances.is_empty()
            && !self.instances.contains_key(&activation)
        {
            return false;
        }
        self.instances
            .insert(activation, ActivationInfo::new(node, status));
        self.touch();
        true
    }

    /// Try to become the single activation of `grain`.
    ///
    /// Returns `(true, address of the new activation)` when the entry was
    /// empty, or `(false, address of the existing activation)` otherwise.
    pub(crate) fn add_single_activation(
        &mut self,
        grain: &GrainId,
        activation: ActivationId,
        node: NodeAddress,
        status: ActivationStatus,
    ) -> (bool, ActivationAddress) {
        self.single_instance = true;
        if let Some((existing, info)) = self.first() {
            return (
                false,
                ActivationAddress::new(grain.clone(), info.node().clone(), existing),
            );
        }
        self.instances
            .insert(activation, ActivationInfo::new(node.clone(), status));
        self.touch();
        (
            true,
            ActivationAddress::new(grain.clone(), node, activation),
        )
    }

    /// Remove an activation. Returns `true` if the entry is now empty.
    ///
    /// A non-forced removal only applies to activations registered within
    /// `lazy_deregistration_delay`.
    pub(crate) fn remove_activation(
        &mut self,
        activation: &ActivationId,
        force: bool,
        lazy_deregistration_delay: Duration,
    ) -> bool {
        let remove = force
            || (lazy_deregistration_delay > Duration::ZERO
                && self
                    .instances
                    .get(activation)
                    .is_some_and(|info| info.created_at.elapsed() <= lazy_deregistration_delay));
        if remove && self.instances.remove(activation).is_some() {
            self.touch();
        }
        self.instances.is_empty()
    }

    /// Remove `activation` only if it is a cached remote reference.
    /// Returns `true` if the entry is now empty.
    pub(crate) fn remove_cached_activation(&mut self, activation: &ActivationId) -> bool {
        let cached = self
            .instances
            .get(activation)
            .is_some_and(|info| info.status == ActivationStatus::Cached);
        if cached {
            self.instances.remove(activation);
            self.touch();
        }
        self.instances.is_empty()
    }

    /// Replace the local activation `original` by a cached reference to
    /// `remote` hosted on `node`.
    pub(crate) fn cache_address(
        &mut self,
        original: &ActivationId,
        remote: ActivationId,
        node: NodeAddress,
    ) {
        self.instances.remove(original);
        self.instances
            .insert(remote, ActivationInfo::new(node, ActivationStatus::Cached));
        self.touch();
    }

    /// Fold `other` into this entry.
    ///
    /// For a single-instance grain that ends up with several activations,
    /// the lowest activation id survives and the others are returned for
    /// deactivation.
    pub(crate) fn merge(&mut self, grain: &GrainId, other: &GrainInfo) -> Vec<ActivationAddress> {
        let mut modified = false;
        for (activation, info) in &other.instances {
            if !self.instances.contains_key(activation) {
                self.instances.insert(*activation, info.clone());
                modified = true;
            }
        }
        self.single_instance |= other.single_instance;

        let mut duplicates = Vec::new();
        if self.single_instance && self.instances.len() > 1 {
            let mut ordered = std::mem::take(&mut self.instances).into_iter();
            if let Some((keep, info)) = ordered.next() {
                self.instances.insert(keep, info);
            }
            duplicates.extend(ordered.map(|(activation, info)| {
                ActivationAddress::new(grain.clone(), info.node, activation)
            }));
            modified = true;
        }
        if modified {
            self.touch();
        }
        duplicates
    }

    /// Addresses of every registered activation.
    pub fn addresses(&self, grain: &GrainId) -> Vec<ActivationAddress> {
        self.instances
            .iter()
            .map(|(activation, info)| {
                ActivationAddress::new(grain.clone(), info.node.clone(), *activation)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;
    use crate::types::{ClusterId, GrainType};

    fn node(port: u16) -> NodeAddress {
        NodeAddress::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            1,
            ClusterId(0),
        )
    }

    fn grain() -> GrainId {
        GrainId::new(GrainType(1), "g")
    }

    #[test]
    fn test_single_activation_keeps_first() {
        let mut info = GrainInfo::new();
        let (accepted, first) = info.add_single_activation(
            &grain(),
            ActivationId(5),
            node(1),
            ActivationStatus::RequestedOwnership,
        );
        assert!(accepted);

        let (accepted, winner) = info.add_single_activation(
            &grain(),
            ActivationId(9),
            node(2),
            ActivationStatus::RequestedOwnership,
        );
        assert!(!accepted);
        assert_eq!(winner, first);
        assert_eq!(info.instances().len(), 1);
    }

    #[test]
    fn test_add_activation_refuses_second_single_instance() {
        let mut info = GrainInfo::new();
        info.add_single_activation(&grain(), ActivationId(1), node(1), ActivationStatus::Owned);
        assert!(!info.add_activation(ActivationId(2), node(2), ActivationStatus::System));
        assert!(info.add_activation(ActivationId(1), node(3), ActivationStatus::Owned));
    }

    #[test]
    fn test_version_tag_changes_on_mutation() {
        let mut info = GrainInfo::new();
        info.add_activation(ActivationId(1), node(1), ActivationStatus::System);
        let tag = info.version_tag();
        // tags are random, retry until a different one is drawn at least once
        let changed = (0..8).any(|i| {
            info.add_activation(ActivationId(10 + i), node(1), ActivationStatus::System);
            info.version_tag() != tag
        });
        assert!(changed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_removal_window() {
        let delay = Duration::from_secs(10);
        let mut info = GrainInfo::new();
        info.add_activation(ActivationId(1), node(1), ActivationStatus::System);
        info.add_activation(ActivationId(2), node(1), ActivationStatus::System);

        // inside the window, conditional removal applies
        assert!(!info.remove_activation(&ActivationId(1), false, delay));
        assert_eq!(info.instances().len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!info.remove_activation(&ActivationId(2), false, delay));
        assert_eq!(info.instances().len(), 1);

        // no lazy window: only forced removal applies
        assert!(!info.remove_activation(&ActivationId(2), false, Duration::ZERO));
        assert!(info.remove_activation(&ActivationId(2), true, Duration::ZERO));
    }

    #[test]
    fn test_merge_collapses_duplicates_to_lowest_id() {
        let mut left = GrainInfo::new();
        left.add_single_activation(&grain(), ActivationId(7), node(1), ActivationStatus::Owned);
        let mut right = GrainInfo::new();
        right.add_single_activation(&grain(), ActivationId(3), node(2), ActivationStatus::Owned);

        let dropped = left.merge(&grain(), &right);
        assert_eq!(left.first().map(|(id, _)| id), Some(ActivationId(3)));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].activation, ActivationId(7));
        assert_eq!(dropped[0].node, node(1));
    }

    #[test]
    fn test_remove_cached_only_touches_cached() {
        let mut info = GrainInfo::new();
        info.add_single_activation(
            &grain(),
            ActivationId(1),
            node(1),
            ActivationStatus::RequestedOwnership,
        );
        assert!(!info.remove_cached_activation(&ActivationId(1)));

        info.cache_address(&ActivationId(1), ActivationId(2), node(9));
        assert_eq!(
            info.first().map(|(id, a)| (id, a.status())),
            Some((ActivationId(2), ActivationStatus::Cached))
        );
        assert!(info.remove_cached_activation(&ActivationId(2)));
    }
}
