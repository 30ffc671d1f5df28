//! Change-detection mask store
//!
//! Each node has an `IC` mask selecting the digital pins that send an IO
//! sample as soon as they change. The bridge keeps the mask it wants every
//! node to have; the node's own copy is reconciled whenever it reports its
//! mask in an `IC` response.

use std::collections::HashMap;
use tracing::debug;

use crate::config::PIN_COUNT;
use crate::port::Address;

/// Bits that map to a pin
pub const MASK_BITS: u16 = (1 << PIN_COUNT) - 1;

/// Desired change-detection masks per node
#[derive(Debug, Default, Clone)]
pub struct MaskStore {
    masks: HashMap<Address, u16>,
}

impl MaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Desired mask for a node, if one was recorded
    pub fn get(&self, address: &Address) -> Option<u16> {
        self.masks.get(address).copied()
    }

    /// Record the desired mask for a node
    pub fn set(&mut self, address: &Address, mask: u16) {
        self.masks.insert(address.clone(), mask & MASK_BITS);
    }

    /// Set or clear the bit of a single pin, returning the new mask
    ///
    /// Pins outside `0..PIN_COUNT` leave the mask unchanged.
    pub fn set_pin(&mut self, address: &Address, pin: u8, enabled: bool) -> u16 {
        let mask = self.masks.entry(address.clone()).or_insert(0);
        if pin < PIN_COUNT {
            if enabled {
                *mask |= 1 << pin;
            } else {
                *mask &= !(1 << pin);
            }
        }
        debug!(address = %address, pin, enabled, mask = *mask, "Change detection updated");
        *mask
    }

    /// Compare a node-reported mask with the desired one
    ///
    /// When nothing is recorded for the node, the reported mask becomes the
    /// desired mask. Returns the mask to push, or `None` when they agree.
    pub fn reconcile(&mut self, address: &Address, reported: u16) -> Option<u16> {
        let reported = reported & MASK_BITS;
        let target = *self.masks.entry(address.clone()).or_insert(reported);
        (target != reported).then_some(target)
    }

    /// Number of nodes with a recorded mask
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// Whether no mask is recorded
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}
