//! Test utilities for exercising the bridge without a radio or a broker
//!
//! [`MockLink`] stands in for the radio link: packets pushed through its
//! [`MockLinkHandle`] come out of `read_packet`, and every command written
//! is recorded. [`RecordingBus`] records publishes and subscriptions.
//!
//! # Example
//!
//! ```rust,ignore
//! use xbee_bridge::test_utils::{packets, MockLink, RecordingBus};
//!
//! let link = MockLink::new();
//! let radio = link.handle();
//! let bus = RecordingBus::new();
//!
//! radio.push(packets::data("0013a20040401122", "temp:21.5\n"));
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use crate::bus::BusClient;
use crate::error::{BridgeError, Result};
use crate::interface::RadioLink;
use crate::packet::{RadioCommand, RadioPacket};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory radio link
///
/// `read_packet` waits until a packet or error is pushed through a handle,
/// so the mock behaves like a quiet radio rather than a busy loop.
#[derive(Debug)]
pub struct MockLink {
    connected: bool,
    fail_connect: bool,
    incoming_tx: mpsc::UnboundedSender<Result<RadioPacket>>,
    incoming: mpsc::UnboundedReceiver<Result<RadioPacket>>,
    sent: Arc<Mutex<Vec<RadioCommand>>>,
    fail_writes: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    connect_failures: Arc<AtomicUsize>,
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// Create a disconnected mock link
    pub fn new() -> Self {
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        Self {
            connected: false,
            fail_connect: false,
            incoming_tx,
            incoming,
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_writes: Arc::new(AtomicBool::new(false)),
            connects: Arc::new(AtomicUsize::new(0)),
            connect_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a mock link that is already connected
    pub fn connected() -> Self {
        let mut link = Self::new();
        link.connected = true;
        link
    }

    /// Make every connection attempt fail
    pub fn with_connect_failure(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Get a handle for driving the link from a test
    pub fn handle(&self) -> MockLinkHandle {
        MockLinkHandle {
            incoming_tx: self.incoming_tx.clone(),
            sent: Arc::clone(&self.sent),
            fail_writes: Arc::clone(&self.fail_writes),
            connects: Arc::clone(&self.connects),
            connect_failures: Arc::clone(&self.connect_failures),
        }
    }

    /// Commands written so far
    pub fn sent(&self) -> Vec<RadioCommand> {
        lock(&self.sent).clone()
    }

    /// Make writes fail
    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl RadioLink for MockLink {
    async fn connect(&mut self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.fail_connect || scripted {
            return Err(BridgeError::LinkConnectFailed {
                link: "mock".to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn read_packet(&mut self) -> Result<Option<RadioPacket>> {
        match self.incoming.recv().await {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(e),
            None => Err(BridgeError::Disconnected),
        }
    }

    async fn send_command(&mut self, command: &RadioCommand) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BridgeError::WriteError("simulated failure".to_string()));
        }
        lock(&self.sent).push(command.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Test-side handle of a [`MockLink`]
#[derive(Debug, Clone)]
pub struct MockLinkHandle {
    incoming_tx: mpsc::UnboundedSender<Result<RadioPacket>>,
    sent: Arc<Mutex<Vec<RadioCommand>>>,
    fail_writes: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    connect_failures: Arc<AtomicUsize>,
}

impl MockLinkHandle {
    /// Deliver a packet to the bridge
    pub fn push(&self, packet: RadioPacket) {
        let _ = self.incoming_tx.send(Ok(packet));
    }

    /// Make the next read fail
    pub fn push_error(&self, error: BridgeError) {
        let _ = self.incoming_tx.send(Err(error));
    }

    /// Commands written so far
    pub fn sent(&self) -> Vec<RadioCommand> {
        lock(&self.sent).clone()
    }

    /// Commands written so far, as `(command, parameter)` pairs
    pub fn sent_commands(&self) -> Vec<(String, Option<Vec<u8>>)> {
        lock(&self.sent)
            .iter()
            .map(|cmd| (cmd.command().to_string(), cmd.parameter().map(<[u8]>::to_vec)))
            .collect()
    }

    /// Forget recorded commands
    pub fn clear_sent(&self) {
        lock(&self.sent).clear();
    }

    /// Make writes fail
    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }

    /// Number of connection attempts
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }
}

/// Bus client that records everything
#[derive(Debug, Clone, Default)]
pub struct RecordingBus {
    published: Arc<Mutex<Vec<(String, String)>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingBus {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// `(topic, value)` pairs published so far
    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.published).clone()
    }

    /// Values published on a topic
    pub fn values(&self, topic: &str) -> Vec<String> {
        lock(&self.published)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Topics subscribed so far, in order
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    /// Forget recorded publishes
    pub fn clear(&self) {
        lock(&self.published).clear();
    }

    /// Make publishes fail
    pub fn fail(&self, enabled: bool) {
        self.fail.store(enabled, Ordering::SeqCst);
    }
}

impl BusClient for RecordingBus {
    fn publish(&self, topic: &str, value: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::PublishFailed {
                topic: topic.to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        lock(&self.published).push((topic.to_string(), value.to_string()));
        Ok(())
    }

    fn subscribe(&self, topics: &[String]) -> Result<()> {
        lock(&self.subscriptions).extend(topics.iter().cloned());
        Ok(())
    }
}

/// Packet record builders
pub mod packets {
    use std::collections::BTreeMap;

    use crate::packet::{DiscoveryRecord, RadioPacket, ResponseParameter, SampleValue};

    /// Serial data received from a node
    pub fn data(address: &str, text: &str) -> RadioPacket {
        RadioPacket::DataReceived {
            source_addr_long: Some(address.to_string()),
            rf_data: text.to_string(),
        }
    }

    /// A single IO sample
    pub fn io_sample(address: &str, values: &[(&str, SampleValue)]) -> RadioPacket {
        let sample: BTreeMap<String, SampleValue> = values
            .iter()
            .map(|(port, value)| (port.to_string(), value.clone()))
            .collect();
        RadioPacket::IoSample {
            source_addr_long: Some(address.to_string()),
            samples: vec![sample],
        }
    }

    /// Node identification indicator
    pub fn node_id(address: &str, alias: &str) -> RadioPacket {
        RadioPacket::NodeIdentification {
            source_addr_long: Some(address.to_string()),
            node_id: alias.to_string(),
        }
    }

    /// Local `ND` answer for a discovered node
    pub fn discovery(status: u8, address: &str, alias: &str) -> RadioPacket {
        RadioPacket::LocalCommandResponse {
            command: "ND".to_string(),
            status,
            parameter: Some(ResponseParameter::Discovery(DiscoveryRecord {
                source_addr_long: address.to_string(),
                node_identifier: alias.to_string(),
            })),
        }
    }

    /// Remote command response with a hex parameter
    pub fn remote_response(address: &str, command: &str, status: u8, parameter: &str) -> RadioPacket {
        RadioPacket::RemoteCommandResponse {
            source_addr_long: Some(address.to_string()),
            command: command.to_string(),
            status,
            parameter: (!parameter.is_empty()).then(|| ResponseParameter::Raw(parameter.to_string())),
        }
    }
}
