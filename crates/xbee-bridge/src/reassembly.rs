//! Line reassembly for serial data streams
//!
//! Data written to the serial port of a remote radio may arrive split over
//! several packets. Fragments are buffered per sender until a line break
//! is seen; complete lines are handed back in arrival order and whatever
//! follows the last line break stays pending.

use std::collections::HashMap;
use tracing::{trace, warn};

use crate::port::Address;

/// Per-node line accumulator
#[derive(Debug)]
pub struct ReassemblyBuffer {
    /// Unterminated data per sender
    pending: HashMap<Address, String>,
    /// Upper bound for a single pending buffer, in bytes
    max_pending: usize,
}

impl ReassemblyBuffer {
    /// Create a buffer bounding each node's pending data to `max_pending` bytes
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Append a fragment and return every line it completes
    ///
    /// Lines are stripped of trailing whitespace. When the pending
    /// remainder outgrows the bound, its oldest bytes are dropped.
    pub fn feed(&mut self, address: &Address, fragment: &str) -> Vec<String> {
        let buffer = self.pending.entry(address.clone()).or_default();
        buffer.push_str(fragment);

        let count = buffer.matches('\n').count();
        if count == 0 {
            Self::enforce_bound(address, buffer, self.max_pending);
            trace!(address = %address, pending = buffer.len(), "No complete line yet");
            return Vec::new();
        }

        let mut pieces: Vec<&str> = buffer.split('\n').collect();
        let remainder = pieces.pop().unwrap_or_default().to_string();
        let lines = pieces
            .into_iter()
            .map(|line| line.trim_end().to_string())
            .collect();

        *buffer = remainder;
        Self::enforce_bound(address, buffer, self.max_pending);
        lines
    }

    /// Data currently pending for a node
    pub fn pending(&self, address: &Address) -> Option<&str> {
        self.pending.get(address).map(String::as_str)
    }

    /// Number of nodes with a buffer
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no node has a buffer
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop all pending data
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn enforce_bound(address: &Address, buffer: &mut String, max: usize) {
        if buffer.len() <= max {
            return;
        }
        let mut cut = buffer.len() - max;
        while !buffer.is_char_boundary(cut) {
            cut += 1;
        }
        warn!(
            address = %address,
            dropped = cut,
            "Serial buffer overflow, dropping oldest data"
        );
        buffer.drain(..cut);
    }
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new(1024)
    }
}
