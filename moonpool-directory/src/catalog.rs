//! Hook into the activation catalog.
//!
//! The directory decides that some activations must go (a lost
//! cross-cluster race, a duplicate found while merging partitions) but the
//! catalog that hosts them is external. It is reached through
//! [`ActivationDeactivator`].

use std::cell::RefCell;

use crate::types::ActivationAddress;

/// Deactivates activations the directory has given up on.
pub trait ActivationDeactivator {
    /// Deactivate every activation in `addresses`. Must not block.
    fn deactivate_activations(&self, addresses: Vec<ActivationAddress>);
}

/// Deactivator that only records what it was asked to deactivate.
#[derive(Debug, Default)]
pub struct RecordingDeactivator {
    deactivated: RefCell<Vec<ActivationAddress>>,
}

impl RecordingDeactivator {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything deactivated so far, in request order.
    pub fn deactivated(&self) -> Vec<ActivationAddress> {
        self.deactivated.borrow().clone()
    }
}

impl ActivationDeactivator for RecordingDeactivator {
    fn deactivate_activations(&self, addresses: Vec<ActivationAddress>) {
        if addresses.is_empty() {
            return;
        }
        tracing::debug!(count = addresses.len(), "deactivating activations");
        self.deactivated.borrow_mut().extend(addresses);
    }
}
