//! Membership source: which nodes of the local cluster are alive.
//!
//! The directory does not detect failures itself. It consumes a
//! [`MembershipView`] to validate nodes and receives status changes through
//! [`MembershipListener`], which drive ring updates and partition handoff.
//!
//! # Design
//!
//! - [`SharedMembership`] is an `Rc`-shared in-memory implementation for
//!   simulations: every node of a cluster holds the same view, and a test
//!   flips statuses to inject joins, graceful stops and crashes.
//! - Listeners are held as `Weak` references and notified after the
//!   internal borrow is released, so a listener may read the view back.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::NodeAddress;

/// Lifecycle status of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Starting up; not yet part of the ring.
    Joining,
    /// Serving requests.
    Active,
    /// Shutting down gracefully.
    ShuttingDown,
    /// Stopping gracefully.
    Stopping,
    /// Declared dead.
    Dead,
}

impl NodeStatus {
    /// Whether the node is leaving the cluster.
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            NodeStatus::ShuttingDown | NodeStatus::Stopping | NodeStatus::Dead
        )
    }
}

/// Errors from membership updates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    /// The node is not part of the membership view.
    #[error("node {node} is not a member")]
    NotFound {
        /// The unknown node.
        node: NodeAddress,
    },
}

/// Receives node status changes.
pub trait MembershipListener {
    /// Called once per status change of `node`.
    fn on_status_change(&self, node: &NodeAddress, status: NodeStatus);
}

/// Read side of the membership view.
pub trait MembershipView: fmt::Debug {
    /// Whether `node` is a known, non-dead member.
    fn is_valid(&self, node: &NodeAddress) -> bool;

    /// Members currently `Active`.
    fn active_members(&self) -> Vec<NodeAddress>;

    /// Last known status of `node`.
    fn status(&self, node: &NodeAddress) -> Option<NodeStatus>;
}

/// In-memory membership shared by every node of one simulated cluster.
#[derive(Default)]
pub struct SharedMembership {
    statuses: RefCell<HashMap<NodeAddress, NodeStatus>>,
    listeners: RefCell<Vec<Weak<dyn MembershipListener>>>,
}

impl fmt::Debug for SharedMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMembership")
            .field("statuses", &self.statuses.borrow())
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}

impl SharedMembership {
    /// Create an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a view where every node in `members` is already `Active`.
    pub fn with_active(members: impl IntoIterator<Item = NodeAddress>) -> Self {
        let view = Self::new();
        view.statuses
            .borrow_mut()
            .extend(members.into_iter().map(|node| (node, NodeStatus::Active)));
        view
    }

    /// Subscribe a listener. Dropped listeners are pruned on the next
    /// notification.
    pub fn subscribe(&self, listener: Weak<dyn MembershipListener>) {
        self.listeners.borrow_mut().push(listener);
    }

    /// Record a status for `node` (adding it if unknown) and notify every
    /// listener.
    pub fn set_status(&self, node: NodeAddress, status: NodeStatus) {
        let previous = self.statuses.borrow_mut().insert(node.clone(), status);
        if previous == Some(status) {
            return;
        }
        debug!(node = %node, ?previous, ?status, "membership status change");
        self.notify(&node, status);
    }

    /// Change the status of a known member.
    pub fn update_status(
        &self,
        node: &NodeAddress,
        status: NodeStatus,
    ) -> Result<(), MembershipError> {
        if !self.statuses.borrow().contains_key(node) {
            return Err(MembershipError::NotFound { node: node.clone() });
        }
        self.set_status(node.clone(), status);
        Ok(())
    }

    fn notify(&self, node: &NodeAddress, status: NodeStatus) {
        let listeners: Vec<Rc<dyn MembershipListener>> = {
            let mut registered = self.listeners.borrow_mut();
            registered.retain(|listener| listener.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_status_change(node, status);
        }
    }
}

impl MembershipView for SharedMembership {
    fn is_valid(&self, node: &NodeAddress) -> bool {
        self.statuses
            .borrow()
            .get(node)
            .is_some_and(|status| *status != NodeStatus::Dead)
    }

    fn active_members(&self) -> Vec<NodeAddress> {
        let mut members: Vec<NodeAddress> = self
            .statuses
            .borrow()
            .iter()
            .filter(|(_, status)| **status == NodeStatus::Active)
            .map(|(node, _)| node.clone())
            .collect();
        members.sort_by_key(|node| (node.endpoint(), node.generation()));
        members
    }

    fn status(&self, node: &NodeAddress) -> Option<NodeStatus> {
        self.statuses.borrow().get(node).copied()
    }
}
