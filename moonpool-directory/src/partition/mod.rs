//! Directory partition: the slice of the grain directory a node owns.
//!
//! A partition maps each [`GrainId`] to a [`GrainInfo`] and keeps an index
//! of activations in [`ActivationStatus::Doubtful`] state for anti-entropy.
//! All state lives behind one `RefCell`; every method borrows it for the
//! duration of a synchronous mutation and never across an `.await`.
//!
//! The same type stores replicas of other nodes' partitions, which is why
//! it offers [`DirectoryPartition::split`], [`DirectoryPartition::merge`],
//! [`DirectoryPartition::set`] and [`DirectoryPartition::update`].
//!
//! # Orleans Reference
//!
//! `GrainDirectoryPartition` of the geo-distributed directory prototype.

mod grain_info;

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, trace};

pub use grain_info::{ActivationInfo, ActivationStatus, GrainInfo};

use crate::error::DirectoryError;
use crate::types::{ActivationAddress, ActivationId, ClusterId, GrainId, NodeAddress, VersionTag};

/// Activations in `Doubtful` state, keyed by activation.
pub type DoubtfulSet = HashMap<ActivationId, GrainId>;

/// Replication delta: `None` deletes the grain on the replica.
pub type PartitionDelta = HashMap<GrainId, Option<GrainInfo>>;

/// Answer of a cluster to a cross-cluster activation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationResponseStatus {
    /// The answering cluster does not stand in the way.
    Pass,
    /// The answering cluster has, or is about to have, the activation.
    Failed,
}

/// Response to a cross-cluster activation request.
///
/// `winner` is set only with [`ActivationResponseStatus::Failed`] when the
/// answering cluster already holds an owned or doubtful activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationResponse {
    /// Pass or fail.
    pub status: ActivationResponseStatus,
    /// Existing activation in the answering cluster.
    pub winner: Option<ActivationAddress>,
}

impl ActivationResponse {
    /// A `Pass` answer.
    pub fn pass() -> Self {
        Self {
            status: ActivationResponseStatus::Pass,
            winner: None,
        }
    }

    /// A `Failed` answer, with the existing activation if there is one.
    pub fn failed(winner: Option<ActivationAddress>) -> Self {
        Self {
            status: ActivationResponseStatus::Failed,
            winner,
        }
    }
}

/// Whether cluster `left` takes precedence over cluster `right` for a grain
/// whose uniform hash is `grain_hash`.
///
/// `prec(c) = grain_hash XOR c`; the lower precedence value wins and ties
/// go to the lower cluster id. Both clusters must be valid.
pub fn activation_precedence(
    grain_hash: u32,
    left: ClusterId,
    right: ClusterId,
) -> Result<bool, DirectoryError> {
    for cluster in [left, right] {
        if !cluster.is_valid() {
            return Err(DirectoryError::InvalidClusterId { cluster });
        }
    }
    let prec_left = i64::from(grain_hash) ^ i64::from(left.0);
    let prec_right = i64::from(grain_hash) ^ i64::from(right.0);
    Ok(prec_left < prec_right || (prec_left == prec_right && left.0 < right.0))
}

#[derive(Debug, Default, Clone)]
struct PartitionState {
    data: HashMap<GrainId, GrainInfo>,
    doubtful: DoubtfulSet,
}

fn doubtful_index(data: &HashMap<GrainId, GrainInfo>) -> DoubtfulSet {
    data.iter()
        .flat_map(|(grain, info)| {
            info.instances()
                .iter()
                .filter(|(_, a)| a.status() == ActivationStatus::Doubtful)
                .map(move |(activation, _)| (*activation, grain.clone()))
        })
        .collect()
}

/// One node's directory partition, or a replica of another node's.
#[derive(Debug)]
pub struct DirectoryPartition {
    cluster: ClusterId,
    lazy_deregistration_delay: Duration,
    state: RefCell<PartitionState>,
}

impl DirectoryPartition {
    /// Create an empty partition for a node of `cluster`.
    pub fn new(cluster: ClusterId, lazy_deregistration_delay: Duration) -> Self {
        Self {
            cluster,
            lazy_deregistration_delay,
            state: RefCell::new(PartitionState::default()),
        }
    }

    fn sibling(&self, data: HashMap<GrainId, GrainInfo>) -> Self {
        let doubtful = doubtful_index(&data);
        Self {
            cluster: self.cluster,
            lazy_deregistration_delay: self.lazy_deregistration_delay,
            state: RefCell::new(PartitionState { data, doubtful }),
        }
    }

    /// Cluster this partition resolves races for.
    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    /// Number of grains.
    pub fn len(&self) -> usize {
        self.state.borrow().data.len()
    }

    /// Whether the partition holds no grain.
    pub fn is_empty(&self) -> bool {
        self.state.borrow().data.is_empty()
    }

    /// Whether `grain` has an entry.
    pub fn contains(&self, grain: &GrainId) -> bool {
        self.state.borrow().data.contains_key(grain)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.state.borrow_mut();
        state.data.clear();
        state.doubtful.clear();
    }

    /// Snapshot of every entry.
    pub fn get_items(&self) -> HashMap<GrainId, GrainInfo> {
        self.state.borrow().data.clone()
    }

    /// Snapshot of one entry.
    pub fn get_grain_info(&self, grain: &GrainId) -> Option<GrainInfo> {
        self.state.borrow().data.get(grain).cloned()
    }

    /// Register a multi-activation grain instance; no conflict check.
    pub fn add_activation(
        &self,
        grain: &GrainId,
        activation: ActivationId,
        node: NodeAddress,
    ) -> Result<ActivationAddress, DirectoryError> {
        self.transfer_activation(grain, activation, node, ActivationStatus::System)
    }

    /// Insert an activation with an explicit status, as received from the
    /// previous owner of the grain.
    pub fn transfer_activation(
        &self,
        grain: &GrainId,
        activation: ActivationId,
        node: NodeAddress,
        status: ActivationStatus,
    ) -> Result<ActivationAddress, DirectoryError> {
        trace!(grain = %grain, activation = %activation, node = %node, "adding activation");
        let mut state = self.state.borrow_mut();
        let info = state.data.entry(grain.clone()).or_default();
        if !info.add_activation(activation, node.clone(), status) {
            return Err(DirectoryError::invariant(
                grain,
                "second activation for a single-instance grain",
            ));
        }
        if status == ActivationStatus::Doubtful {
            state.doubtful.insert(activation, grain.clone());
        } else {
            state.doubtful.remove(&activation);
        }
        Ok(ActivationAddress::new(grain.clone(), node, activation))
    }

    /// Try to register the single activation of `grain`.
    ///
    /// Returns `(true, address)` when the activation was accepted in
    /// `RequestedOwnership` state, or `(false, existing)` when the grain
    /// already has an activation. The second activation is never stored.
    pub fn add_single_activation(
        &self,
        grain: &GrainId,
        activation: ActivationId,
        node: NodeAddress,
    ) -> (bool, ActivationAddress) {
        trace!(grain = %grain, activation = %activation, node = %node, "adding single activation");
        let mut state = self.state.borrow_mut();
        state
            .data
            .entry(grain.clone())
            .or_default()
            .add_single_activation(
                grain,
                activation,
                node,
                ActivationStatus::RequestedOwnership,
            )
    }

    /// Register a system activation: single-instance, no cross-cluster
    /// protocol. Returns the registered (possibly pre-existing) address.
    pub fn add_system_activation(
        &self,
        grain: &GrainId,
        activation: ActivationId,
        node: NodeAddress,
    ) -> ActivationAddress {
        self.transfer_single_activation(grain, activation, node, ActivationStatus::System)
    }

    /// Insert a single activation with an explicit status unless the grain
    /// already has one. Returns the registered address.
    pub fn transfer_single_activation(
        &self,
        grain: &GrainId,
        activation: ActivationId,
        node: NodeAddress,
        status: ActivationStatus,
    ) -> ActivationAddress {
        let mut state = self.state.borrow_mut();
        let (accepted, address) = state
            .data
            .entry(grain.clone())
            .or_default()
            .add_single_activation(grain, activation, node, status);
        if accepted && status == ActivationStatus::Doubtful {
            state.doubtful.insert(activation, grain.clone());
        }
        address
    }

    /// Remove one activation; the grain entry goes away with its last
    /// activation.
    ///
    /// Without `force`, only an activation registered within the lazy
    /// deregistration delay is removed.
    pub fn remove_activation(&self, grain: &GrainId, activation: &ActivationId, force: bool) {
        trace!(grain = %grain, activation = %activation, force, "removing activation");
        let mut state = self.state.borrow_mut();
        let delay = self.lazy_deregistration_delay;
        let now_empty = state
            .data
            .get_mut(grain)
            .is_some_and(|info| info.remove_activation(activation, force, delay));
        if now_empty {
            state.data.remove(grain);
        }
        let still_registered = state
            .data
            .get(grain)
            .is_some_and(|info| info.instances().contains_key(activation));
        if !still_registered {
            state.doubtful.remove(activation);
        }
    }

    /// Remove a grain and all its activations.
    pub fn remove_grain(&self, grain: &GrainId) {
        trace!(grain = %grain, "removing grain");
        let mut state = self.state.borrow_mut();
        if let Some(info) = state.data.remove(grain) {
            for activation in info.instances().keys() {
                state.doubtful.remove(activation);
            }
        }
    }

    /// Remove `address` if it is a cached reference to another cluster's
    /// activation.
    pub fn remove_cached_activation(&self, address: &ActivationAddress) {
        let mut state = self.state.borrow_mut();
        let now_empty = state
            .data
            .get_mut(&address.grain)
            .is_some_and(|info| info.remove_cached_activation(&address.activation));
        if now_empty {
            state.data.remove(&address.grain);
        }
    }

    /// Registered activations of `grain` and the entry's version tag.
    pub fn lookup(&self, grain: &GrainId) -> Option<(Vec<ActivationAddress>, VersionTag)> {
        self.state
            .borrow()
            .data
            .get(grain)
            .map(|info| (info.addresses(grain), info.version_tag()))
    }

    /// Version tag of `grain`'s entry.
    pub fn get_etag(&self, grain: &GrainId) -> Option<VersionTag> {
        self.state
            .borrow()
            .data
            .get(grain)
            .map(GrainInfo::version_tag)
    }

    /// Answer another cluster asking whether it may activate `grain`.
    ///
    /// - `Owned` or `Doubtful` here: `Failed` with our activation.
    /// - `RequestedOwnership` here: a race. If we lose on precedence our
    ///   activation becomes `RaceLoser` and we answer `Pass`, else `Failed`
    ///   without an address.
    /// - Anything else, or no entry: `Pass`.
    pub fn grain_status_response(
        &self,
        grain: &GrainId,
        remote_cluster: ClusterId,
    ) -> Result<ActivationResponse, DirectoryError> {
        let mut state = self.state.borrow_mut();
        let Some(info) = state.data.get_mut(grain) else {
            return Ok(ActivationResponse::pass());
        };
        if !info.is_single_instance() {
            return Err(DirectoryError::invariant(
                grain,
                "cross-cluster request for a multi-activation grain",
            ));
        }
        let Some((activation, record)) = info.first() else {
            return Ok(ActivationResponse::pass());
        };
        match record.status() {
            ActivationStatus::Owned | ActivationStatus::Doubtful => {
                Ok(ActivationResponse::failed(Some(ActivationAddress::new(
                    grain.clone(),
                    record.node().clone(),
                    activation,
                ))))
            }
            ActivationStatus::RequestedOwnership => {
                if activation_precedence(grain.uniform_hash(), self.cluster, remote_cluster)? {
                    Ok(ActivationResponse::failed(None))
                } else {
                    debug!(grain = %grain, remote = %remote_cluster, "lost activation race");
                    info.set_status(&activation, ActivationStatus::RaceLoser);
                    Ok(ActivationResponse::pass())
                }
            }
            _ => Ok(ActivationResponse::pass()),
        }
    }

    /// Conclude the cross-cluster protocol for `activation` with `status`
    /// (`Owned` or `Doubtful`).
    ///
    /// Returns `false` if the activation lost a race in the meantime; it is
    /// then back to `RequestedOwnership` and the protocol must run again.
    pub fn take_ownership(
        &self,
        grain: &GrainId,
        activation: ActivationId,
        status: ActivationStatus,
    ) -> Result<bool, DirectoryError> {
        if !matches!(status, ActivationStatus::Owned | ActivationStatus::Doubtful) {
            return Err(DirectoryError::invariant(
                grain,
                format!("cannot take ownership with status {status}"),
            ));
        }
        let mut state = self.state.borrow_mut();
        let Some(info) = state.data.get_mut(grain) else {
            return Err(DirectoryError::GrainNotFound {
                grain: grain.clone(),
            });
        };
        let Some((current, current_status)) =
            info.first().map(|(id, record)| (id, record.status()))
        else {
            return Err(DirectoryError::GrainNotFound {
                grain: grain.clone(),
            });
        };
        if current != activation
            || !matches!(
                current_status,
                ActivationStatus::RequestedOwnership | ActivationStatus::RaceLoser
            )
        {
            return Err(DirectoryError::invariant(
                grain,
                format!(
                    "activation {current} is {current_status} while {activation} takes ownership"
                ),
            ));
        }
        if current_status == ActivationStatus::RaceLoser {
            info.set_status(&current, ActivationStatus::RequestedOwnership);
            return Ok(false);
        }
        info.set_status(&current, status);
        if status == ActivationStatus::Doubtful {
            state.doubtful.insert(activation, grain.clone());
        }
        Ok(true)
    }

    /// Replace our pending activation `original` by a cached reference to
    /// the activation `remote` another cluster already owns.
    pub fn cache_address(
        &self,
        grain: &GrainId,
        remote: ActivationId,
        node: NodeAddress,
        original: ActivationId,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.borrow_mut();
        let Some(info) = state.data.get_mut(grain) else {
            return Err(DirectoryError::GrainNotFound {
                grain: grain.clone(),
            });
        };
        if !info.is_single_instance() {
            return Err(DirectoryError::invariant(
                grain,
                "cannot cache a remote activation for a multi-activation grain",
            ));
        }
        let Some(status) = info.instances().get(&original).map(ActivationInfo::status) else {
            return Err(DirectoryError::invariant(
                grain,
                format!("activation {original} is not registered"),
            ));
        };
        if !matches!(
            status,
            ActivationStatus::RequestedOwnership | ActivationStatus::RaceLoser
        ) {
            return Err(DirectoryError::invariant(
                grain,
                format!("cannot cache over activation {original} in state {status}"),
            ));
        }
        info.cache_address(&original, remote, node);
        Ok(())
    }

    /// Snapshot of the doubtful index.
    pub fn get_doubtful_activations(&self) -> DoubtfulSet {
        self.state.borrow().doubtful.clone()
    }

    /// Compare another cluster's doubtful activations with ours.
    ///
    /// Returns `(local losers, remote losers)`. A local `Owned` or
    /// `Doubtful` activation that loses on precedence moves back to
    /// `RequestedOwnership` and is returned for deactivation. A remote
    /// activation is dropped from the returned set when it wins or when we
    /// have no entry for its grain.
    pub fn resolve_doubtful_activations(
        &self,
        mut remote: DoubtfulSet,
        sender: ClusterId,
    ) -> Result<(Vec<ActivationAddress>, DoubtfulSet), DirectoryError> {
        let mut to_kill = Vec::new();
        let mut remote_winners = Vec::new();
        let mut state = self.state.borrow_mut();
        let PartitionState { data, doubtful } = &mut *state;

        for (remote_activation, grain) in &remote {
            let Some(info) = data.get_mut(grain) else {
                remote_winners.push(*remote_activation);
                continue;
            };
            let Some((local, status, node)) = info
                .first()
                .map(|(id, record)| (id, record.status(), record.node().clone()))
            else {
                remote_winners.push(*remote_activation);
                continue;
            };
            if !matches!(status, ActivationStatus::Doubtful | ActivationStatus::Owned) {
                continue;
            }
            if !activation_precedence(grain.uniform_hash(), self.cluster, sender)? {
                debug!(grain = %grain, activation = %local, remote = %sender, "local doubtful activation lost");
                doubtful.remove(&local);
                info.set_status(&local, ActivationStatus::RequestedOwnership);
                to_kill.push(ActivationAddress::new(grain.clone(), node, local));
                remote_winners.push(*remote_activation);
            }
        }
        for activation in remote_winners {
            remote.remove(&activation);
        }
        Ok((to_kill, remote))
    }

    /// Apply the outcome of an anti-entropy round.
    ///
    /// Doubtful losers move back to `RequestedOwnership` and are returned
    /// so the creation protocol can rerun for them; doubtful winners become
    /// `Owned`.
    pub fn process_anti_entropy_results(
        &self,
        losers: Option<&DoubtfulSet>,
        winners: Option<&DoubtfulSet>,
    ) -> Vec<ActivationAddress> {
        let mut rerun = Vec::new();
        let mut state = self.state.borrow_mut();
        let PartitionState { data, doubtful } = &mut *state;

        let mut transition =
            |set: &DoubtfulSet, to: ActivationStatus, rerun: &mut Vec<ActivationAddress>| {
                for (activation, grain) in set {
                    let Some(info) = data.get_mut(grain) else {
                        continue;
                    };
                    let Some(node) = info
                        .instances()
                        .get(activation)
                        .filter(|record| record.status() == ActivationStatus::Doubtful)
                        .map(|record| record.node().clone())
                    else {
                        continue;
                    };
                    info.set_status(activation, to);
                    doubtful.remove(activation);
                    if to == ActivationStatus::RequestedOwnership {
                        rerun.push(ActivationAddress::new(grain.clone(), node, *activation));
                    }
                }
            };

        if let Some(losers) = losers {
            transition(losers, ActivationStatus::RequestedOwnership, &mut rerun);
        }
        if let Some(winners) = winners {
            transition(winners, ActivationStatus::Owned, &mut rerun);
        }
        rerun
    }

    /// Fold `other` into this partition.
    ///
    /// Returns the single-instance duplicates that lost the merge and must
    /// be deactivated.
    pub fn merge(&self, other: &DirectoryPartition) -> Vec<ActivationAddress> {
        let incoming = other.get_items();
        let mut duplicates = Vec::new();
        let mut state = self.state.borrow_mut();
        for (grain, info) in incoming {
            match state.data.get_mut(&grain) {
                Some(existing) => {
                    debug!(grain = %grain, "grain present on both sides of a merge");
                    duplicates.extend(existing.merge(&grain, &info));
                }
                None => {
                    state.data.insert(grain, info);
                }
            }
        }
        state.doubtful = doubtful_index(&state.data);
        duplicates
    }

    /// Extract the entries whose grain satisfies `predicate` into a new
    /// partition. With `modify_origin` the entries are moved, otherwise
    /// copied.
    pub fn split<F>(&self, predicate: F, modify_origin: bool) -> DirectoryPartition
    where
        F: Fn(&GrainId) -> bool,
    {
        let mut state = self.state.borrow_mut();
        let selected: Vec<GrainId> = state
            .data
            .keys()
            .filter(|grain| predicate(grain))
            .cloned()
            .collect();

        let mut extracted = HashMap::with_capacity(selected.len());
        for grain in selected {
            let info = if modify_origin {
                state.data.remove(&grain)
            } else {
                state.data.get(&grain).cloned()
            };
            if let Some(info) = info {
                extracted.insert(grain, info);
            }
        }
        if modify_origin {
            state.doubtful = doubtful_index(&state.data);
        }
        drop(state);
        self.sibling(extracted)
    }

    /// Every activation of single-instance (`single = true`) or
    /// multi-activation (`single = false`) grains.
    pub fn to_list_of_activations(&self, single: bool) -> Vec<ActivationAddress> {
        self.to_list_with_status(single)
            .into_iter()
            .map(|(address, _)| address)
            .collect()
    }

    /// Like [`DirectoryPartition::to_list_of_activations`], with each
    /// activation's status.
    pub fn to_list_with_status(&self, single: bool) -> Vec<(ActivationAddress, ActivationStatus)> {
        self.state
            .borrow()
            .data
            .iter()
            .filter(|(_, info)| info.is_single_instance() == single)
            .flat_map(|(grain, info)| {
                info.instances().iter().map(move |(activation, record)| {
                    (
                        ActivationAddress::new(grain.clone(), record.node().clone(), *activation),
                        record.status(),
                    )
                })
            })
            .collect()
    }

    /// Replace the whole content with `data`.
    pub fn set(&self, data: HashMap<GrainId, GrainInfo>) {
        let doubtful = doubtful_index(&data);
        *self.state.borrow_mut() = PartitionState { data, doubtful };
    }

    /// Apply a replication delta.
    pub fn update(&self, delta: PartitionDelta) {
        let mut state = self.state.borrow_mut();
        for (grain, info) in delta {
            match info {
                Some(info) => {
                    state.data.insert(grain, info);
                }
                None => {
                    state.data.remove(&grain);
                }
            }
        }
        state.doubtful = doubtful_index(&state.data);
    }
}
