//! XBee ⇄ pub/sub bridge service
//!
//! The bridge owns every piece of mutable state (routes, reassembly
//! buffers, masks, duplicate records, the paced queue) and runs as a single
//! task. It reacts to these event sources:
//!
//! - packets read from the radio link
//! - commands sent through a [`BridgeHandle`] (bus messages, reload,
//!   resubscribe, stats, shutdown)
//! - the deadline of the next paced query
//! - a housekeeping tick that expires unanswered queries
//! - while the radio link is down, the next reconnection attempt
//!
//! # Radio → bus
//!
//! 1. The packet is classified
//! 2. Serial data is reassembled into `port:value` lines
//! 3. Command responses go through the [`ResponseSequencer`]
//! 4. The routing table resolves the topic
//! 5. The duplicate filter drops unchanged values
//! 6. The value is published
//!
//! # Bus → radio
//!
//! 1. The routing table resolves `(address, port)` from the topic
//! 2. The [`CommandDispatcher`] sends set, `WR`, read-back

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::bus::{BusClient, BusMessage};
use crate::cache::DuplicateFilter;
use crate::config::{BridgeSettings, ReconnectConfig, RouteTable};
use crate::dispatcher::CommandDispatcher;
use crate::error::{BridgeError, Result};
use crate::interface::RadioLink;
use crate::mapper::RoutingTable;
use crate::packet::{classify, Classified, CommandResponse, RadioPacket};
use crate::port::{with_kind, Address, PortKind};
use crate::reassembly::ReassemblyBuffer;
use crate::sequencer::{ResponseSequencer, SequencerStep};

/// Depth of the bridge command channel
const COMMAND_QUEUE_SIZE: usize = 256;

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// A message arrived from the bus
    BusMessage(BusMessage),
    /// Replace the static routes
    Reload(RouteTable),
    /// Subscribe again to every topic, after the bus lost its session
    Resubscribe,
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Shutdown the bridge
    Shutdown,
}

/// Bridge statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Values published to the bus
    pub radio_to_bus: u64,
    /// Bus messages turned into radio commands
    pub bus_to_radio: u64,
    /// Publishes dropped by the duplicate filter
    pub duplicates_suppressed: u64,
    /// Malformed or unsupported radio packets
    pub dropped_packets: u64,
    /// Messages with no topic or no target port
    pub unroutable: u64,
    /// Bus messages rejected for a bad port or value
    pub invalid_requests: u64,
    /// Radio commands that could not be written
    pub command_failures: u64,
    /// Queries that never got a response
    pub expired_responses: u64,
    /// Radio link read errors
    pub link_errors: u64,
    /// Successful radio link reconnections
    pub reconnects: u64,
    /// Bus publish or subscribe failures
    pub publish_failures: u64,
}

/// Handle for controlling the [`XBeeBridge`]
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Deliver a message received from the bus
    pub async fn bus_message(&self, topic: impl Into<String>, payload: impl Into<String>) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::BusMessage(BusMessage::new(topic, payload)))
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }

    /// Replace the static routes and subscribe to their action topics
    pub async fn reload(&self, routes: RouteTable) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Reload(routes))
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }

    /// Subscribe again to all action and synthesized topics
    pub async fn resubscribe(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Resubscribe)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }

    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::GetStats(tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

/// Next reconnection attempt of a lost radio link
#[derive(Debug, Clone, Copy)]
struct PendingReconnect {
    /// 1-based attempt number
    attempt: u32,
    /// When to try
    at: Instant,
}

/// Bridge between an XBee mesh and a pub/sub bus
pub struct XBeeBridge<L: RadioLink> {
    /// Radio link
    link: L,
    /// Bus client
    bus: Arc<dyn BusClient>,
    /// Port for serial lines without a `port:` prefix
    default_port_name: String,
    /// Broadcast `ND` after connecting
    discovery_on_connect: bool,
    /// Housekeeping period
    housekeeping_interval: Duration,
    /// Reconnection policy
    reconnect: ReconnectConfig,
    /// Set while the radio link is down
    pending_reconnect: Option<PendingReconnect>,
    /// Routes and topic patterns
    routing: RoutingTable,
    /// Serial line reassembly
    reassembly: ReassemblyBuffer,
    /// Command response handling
    sequencer: ResponseSequencer,
    /// Outgoing radio commands
    dispatcher: CommandDispatcher,
    /// Duplicate publish filter
    filter: DuplicateFilter,
    /// Topics already subscribed
    subscribed: HashSet<String>,
    /// Command receiver
    command_rx: mpsc::Receiver<BridgeCommand>,
    /// Bridge statistics
    stats: BridgeStats,
}

impl<L: RadioLink> XBeeBridge<L> {
    /// Create a new bridge
    ///
    /// Fails when a topic pattern in `settings` is invalid.
    pub fn new(link: L, settings: &BridgeSettings, bus: Arc<dyn BusClient>) -> Result<(Self, BridgeHandle)> {
        let routing = RoutingTable::from_settings(settings)?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);

        let bridge = Self {
            link,
            bus,
            default_port_name: settings.default_port_name.clone(),
            discovery_on_connect: settings.discovery_on_connect,
            housekeeping_interval: settings.housekeeping_interval,
            reconnect: settings.reconnect.clone(),
            pending_reconnect: None,
            routing,
            reassembly: ReassemblyBuffer::new(settings.max_pending_bytes),
            sequencer: ResponseSequencer::from_settings(settings),
            dispatcher: CommandDispatcher::from_settings(settings),
            filter: DuplicateFilter::from_settings(settings),
            subscribed: HashSet::new(),
            command_rx,
            stats: BridgeStats::default(),
        };

        Ok((bridge, BridgeHandle { command_tx }))
    }

    /// Connect the radio link and announce the bridge
    ///
    /// Subscribes to the action topics of the static routes and requests a
    /// node discovery when configured to.
    pub async fn start(&mut self) -> Result<()> {
        self.link.connect().await?;
        info!(link = self.link.name(), "Connected to radio link");

        self.subscribe(self.routing.action_topics());

        if self.discovery_on_connect {
            info!("Requesting node discovery");
            self.dispatcher.discover(&mut self.link).await;
        }
        Ok(())
    }

    /// Run the bridge service
    ///
    /// Returns an error if the radio link cannot be connected at startup,
    /// or if a lost link cannot be restored within the configured
    /// reconnection attempts. Bus commands are still served while the
    /// link is down.
    pub async fn run(mut self) -> Result<()> {
        info!("Starting XBee bridge");
        self.start().await?;

        let mut housekeeping = tokio::time::interval_at(
            Instant::now() + self.housekeeping_interval,
            self.housekeeping_interval,
        );
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut outcome = Ok(());
        loop {
            let linked = self.pending_reconnect.is_none();
            let deadline = self.dispatcher.next_deadline(Instant::now());
            let retry_at = self.pending_reconnect.map(|pending| pending.at);

            tokio::select! {
                // Handle incoming radio packets
                result = self.link.read_packet(), if linked => {
                    match result {
                        Ok(Some(packet)) => self.handle_radio_packet(packet).await,
                        Ok(None) => trace!("No radio packet available"),
                        Err(e) => {
                            warn!(code = e.error_code(), "Error reading from radio link: {}", e);
                            self.stats.link_errors += 1;
                            if let Err(e) = self.link_lost().await {
                                outcome = Err(e);
                                break;
                            }
                        }
                    }
                }

                // Handle commands
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await {
                                break;
                            }
                        }
                        None => {
                            info!("All bridge handles dropped");
                            break;
                        }
                    }
                }

                // Paced queries
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if linked && deadline.is_some() => {
                    self.dispatcher.drain_due(&mut self.link, Instant::now()).await;
                }

                // Restore a lost link
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    if let Err(e) = self.try_reconnect().await {
                        outcome = Err(e);
                        break;
                    }
                }

                // Periodic housekeeping
                _ = housekeeping.tick() => self.housekeeping(),
            }
        }

        if let Err(e) = self.link.disconnect().await {
            warn!("Error disconnecting from radio link: {}", e);
        }

        info!("XBee bridge stopped");
        outcome
    }

    async fn handle_command(&mut self, command: BridgeCommand) -> bool {
        match command {
            BridgeCommand::BusMessage(message) => {
                self.on_bus_message(&message.topic, &message.payload).await;
            }
            BridgeCommand::Reload(routes) => self.reload(&routes),
            BridgeCommand::Resubscribe => self.resubscribe(),
            BridgeCommand::GetStats(tx) => {
                let _ = tx.send(self.stats());
            }
            BridgeCommand::Shutdown => {
                info!("Bridge shutdown requested");
                return false;
            }
        }
        true
    }

    /// Handle a packet read from the radio link
    pub async fn handle_radio_packet(&mut self, packet: RadioPacket) {
        match classify(packet) {
            Classified::DataStream { source, data } => {
                for line in self.reassembly.feed(&source, &data) {
                    if line.is_empty() {
                        continue;
                    }
                    let (port, value) = match line.split_once(':') {
                        Some((port, value)) => (port.trim().to_string(), value.trim().to_string()),
                        None => (self.default_port_name.clone(), line),
                    };
                    self.on_radio_message(&source, &port, &value);
                }
            }
            Classified::IoSample { source, values } => {
                for (port, value) in values {
                    self.on_radio_message(&source, &port, &value);
                }
            }
            Classified::NodeIdentification { source, alias } => {
                self.on_radio_identification(&source, &alias);
            }
            Classified::LocalCommandResponse(response) | Classified::RemoteCommandResponse(response) => {
                self.on_command_response(&response);
            }
            Classified::Unknown { code, reason } => {
                warn!(code, reason = reason.as_str(), "Dropping radio packet");
                self.stats.dropped_packets += 1;
            }
        }
    }

    fn on_command_response(&mut self, response: &CommandResponse) {
        self.dispatcher.complete(response);

        for step in self.sequencer.handle(response, self.dispatcher.masks_mut()) {
            match step {
                SequencerStep::Identified { address, alias } => {
                    self.on_radio_identification(&address, &alias);
                }
                SequencerStep::PinReport { address, port, value } => {
                    self.on_radio_message(&address, &port, &value);
                }
                SequencerStep::Command(request) => self.dispatcher.enqueue(request),
            }
        }
    }

    /// Value reported by a node port
    ///
    /// Returns whether the value was published.
    pub fn on_radio_message(&mut self, address: &Address, port: &str, value: &str) -> bool {
        debug!(address = %address, port, value, "Message received from radio");

        if self.routing.exposes_undefined() {
            let kind = PortKind::of(port);
            if kind.is_writable() {
                let mut topics = vec![self.routing.input_topic(address, port)];
                if kind == PortKind::Pin && matches!(value, "4" | "5") {
                    let digital = with_kind(port, PortKind::Digital);
                    topics.push(self.routing.input_topic(address, &digital));
                }
                self.subscribe(topics);
            }
        }

        match self.routing.resolve_outbound(address, port) {
            Some(topic) => self.publish(&topic, value),
            None => {
                debug!(address = %address, port, "No route for port");
                self.stats.unroutable += 1;
                false
            }
        }
    }

    /// A node announced itself
    ///
    /// Publishes when it was seen and its alias, then queries its pins.
    pub fn on_radio_identification(&mut self, address: &Address, alias: &str) {
        let now = chrono::Utc::now().timestamp().to_string();
        info!(address = %address, alias, seen = now.as_str(), "Identification received from radio");

        if let Some(topic) = self.routing.resolve_outbound(address, "seen") {
            self.publish(&topic, &now);
        }
        if let Some(topic) = self.routing.resolve_outbound(address, "alias") {
            self.publish(&topic, alias);
        }
        self.dispatcher.send_query(address, None);
    }

    /// A message arrived from the bus
    ///
    /// Returns whether it was turned into radio commands.
    pub async fn on_bus_message(&mut self, topic: &str, value: &str) -> bool {
        debug!(topic, value, "Message received from bus");

        match self.apply_bus_message(topic, value).await {
            Ok(()) => {
                self.stats.bus_to_radio += 1;
                true
            }
            Err(e) => {
                warn!(topic, value, code = e.error_code(), error = %e, "Bus message not applied");
                match e {
                    BridgeError::NoRoute(_) => self.stats.unroutable += 1,
                    e if e.is_input_error() => self.stats.invalid_requests += 1,
                    // Write failures are counted by the dispatcher
                    _ => {}
                }
                false
            }
        }
    }

    async fn apply_bus_message(&mut self, topic: &str, value: &str) -> Result<()> {
        let (address, port) = self
            .routing
            .resolve_inbound(topic)
            .ok_or_else(|| BridgeError::NoRoute(topic.to_string()))?;

        info!(address = %address, port = port.as_str(), value, "Setting radio port");
        self.dispatcher
            .try_send_message(&mut self.link, &address, &port, value, true)
            .await
    }

    /// Replace the static routes, returning how many were loaded
    pub fn load_routes(&mut self, routes: &RouteTable) -> usize {
        let count = self.routing.load(routes);
        info!(routes = count, "Routes loaded");
        count
    }

    /// Reload routes and subscribe to their action topics
    pub fn reload(&mut self, routes: &RouteTable) {
        info!("Reloading");
        self.load_routes(routes);
        self.subscribe(self.routing.action_topics());
    }

    /// Subscribe again to every known topic
    ///
    /// Used when the bus came back without its previous session, which
    /// drops all subscriptions on the broker side.
    pub fn resubscribe(&mut self) {
        let mut topics: Vec<String> = self.subscribed.drain().collect();
        topics.extend(self.routing.action_topics());
        info!(topics = topics.len(), "Resubscribing");
        self.subscribe(topics);
    }

    fn publish(&mut self, topic: &str, value: &str) -> bool {
        let now = Instant::now().into_std();
        if !self.filter.should_publish(topic, value, now) {
            self.stats.duplicates_suppressed += 1;
            return false;
        }

        match self.bus.publish(topic, value) {
            Ok(()) => {
                info!(topic, value, "Sending message to bus");
                self.stats.radio_to_bus += 1;
                true
            }
            Err(e) => {
                warn!(topic, code = e.error_code(), error = %e, "Failed to publish");
                // Let the next identical value through
                self.filter.forget(topic);
                self.stats.publish_failures += 1;
                false
            }
        }
    }

    fn subscribe(&mut self, topics: Vec<String>) {
        let fresh: Vec<String> = topics
            .into_iter()
            .filter(|topic| !self.subscribed.contains(topic))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if fresh.is_empty() {
            return;
        }

        match self.bus.subscribe(&fresh) {
            Ok(()) => {
                debug!(topics = ?fresh, "Subscribed");
                self.subscribed.extend(fresh);
            }
            Err(e) => {
                warn!(code = e.error_code(), error = %e, "Failed to subscribe");
                self.stats.publish_failures += 1;
            }
        }
    }

    fn housekeeping(&mut self) {
        let expired = self.dispatcher.expire(Instant::now());
        self.stats.expired_responses += expired as u64;
        trace!(
            "Bridge stats: radio->bus={}, bus->radio={}, duplicates={}, queued={}",
            self.stats.radio_to_bus,
            self.stats.bus_to_radio,
            self.stats.duplicates_suppressed,
            self.dispatcher.queued()
        );
    }

    /// Drop the failed link and schedule the first reconnection attempt
    async fn link_lost(&mut self) -> Result<()> {
        if let Err(e) = self.link.disconnect().await {
            debug!("Error disconnecting from radio link: {}", e);
        }
        if !self.reconnect.allows_after(0) {
            error!("Radio link lost and reconnection is disabled");
            return Err(BridgeError::Disconnected);
        }
        self.schedule_reconnect(1);
        Ok(())
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        let delay = self.reconnect.delay(attempt);
        debug!(attempt, delay = ?delay, "Scheduling radio link reconnection");
        self.pending_reconnect = Some(PendingReconnect {
            attempt,
            at: Instant::now() + delay,
        });
    }

    /// Try to reconnect the radio link
    ///
    /// A failed attempt schedules the next one with a longer delay; only
    /// running out of attempts is an error.
    async fn try_reconnect(&mut self) -> Result<()> {
        let Some(PendingReconnect { attempt, .. }) = self.pending_reconnect else {
            return Ok(());
        };
        warn!(attempt, "Attempting to reconnect to radio link...");

        match self.link.connect().await {
            Ok(()) => {
                info!(attempt, "Successfully reconnected to radio link");
                self.pending_reconnect = None;
                self.stats.reconnects += 1;
                Ok(())
            }
            Err(e) if self.reconnect.allows_after(attempt) => {
                warn!(attempt, code = e.error_code(), "Reconnection failed: {}", e);
                self.schedule_reconnect(attempt + 1);
                Ok(())
            }
            Err(e) => {
                error!(attempt, "Giving up on radio link: {}", e);
                self.pending_reconnect = None;
                Err(e)
            }
        }
    }

    /// Whether the radio link is up (not waiting for a reconnection)
    pub fn is_linked(&self) -> bool {
        self.pending_reconnect.is_none()
    }

    /// Current statistics
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            command_failures: self.dispatcher.failures(),
            ..self.stats.clone()
        }
    }

    /// Routes and topic patterns
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Outgoing command state
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// The radio link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The radio link, mutably
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }
}
