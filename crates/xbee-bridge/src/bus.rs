//! Pub/sub bus seam
//!
//! The bridge publishes through a [`BusClient`] and never owns the bus
//! connection. Messages arriving from the bus are pushed back into the
//! bridge through [`crate::BridgeHandle::bus_message`].

use crate::error::Result;

/// Message received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the message was received on
    pub topic: String,
    /// Message payload as text
    pub payload: String,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Publishing side of the pub/sub bus
///
/// Calls must not block; implementations queue the request and report a
/// failure only if it could not be queued.
pub trait BusClient: Send + Sync {
    /// Publish a value on a topic
    fn publish(&self, topic: &str, value: &str) -> Result<()>;

    /// Subscribe to a set of topics
    fn subscribe(&self, topics: &[String]) -> Result<()>;
}
