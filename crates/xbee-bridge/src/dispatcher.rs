//! Command dispatcher
//!
//! Turns bus-originated set and query requests into radio command records.
//! Set requests are transmitted immediately as a three step sequence (set,
//! persist or apply, read back). Queries go through a [`PacedQueue`] that
//! the bridge loop drains one command per `query_interval`, so a burst of
//! reads never floods the mesh.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BridgeSettings, PIN_COUNT};
use crate::error::{BridgeError, Result};
use crate::interface::RadioLink;
use crate::mask::MaskStore;
use crate::packet::{CommandResponse, RadioCommand};
use crate::port::{port_number, Address, PortKind};

/// Digital output driven low
pub const LEVEL_LOW: u8 = 4;

/// Digital output driven high
pub const LEVEL_HIGH: u8 = 5;

/// A command waiting to be framed and transmitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Target node, `None` for the local coordinator
    pub address: Option<Address>,
    /// Two-letter AT command
    pub command: String,
    /// Optional parameter bytes
    pub parameter: Option<Vec<u8>>,
}

impl Request {
    /// Command for the local coordinator
    pub fn local(command: impl Into<String>) -> Self {
        Self {
            address: None,
            command: command.into(),
            parameter: None,
        }
    }

    /// Command for a remote node
    pub fn remote(address: &Address, command: impl Into<String>, parameter: Option<Vec<u8>>) -> Self {
        Self {
            address: Some(address.clone()),
            command: command.into(),
            parameter,
        }
    }

    /// Whether this is a read (no parameter)
    pub fn is_query(&self) -> bool {
        self.parameter.is_none()
    }

    fn into_command(self, frame_id: u8) -> RadioCommand {
        match self.address {
            Some(dest_addr_long) => RadioCommand::RemoteAt {
                dest_addr_long,
                command: self.command,
                parameter: self.parameter,
                frame_id,
            },
            None => RadioCommand::At {
                command: self.command,
                parameter: self.parameter,
                frame_id,
            },
        }
    }
}

/// FIFO of requests with a minimum spacing between transmissions
#[derive(Debug)]
pub struct PacedQueue {
    queue: VecDeque<Request>,
    interval: Duration,
    ready_at: Option<Instant>,
}

impl PacedQueue {
    /// Create a queue releasing at most one request per `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            interval,
            ready_at: None,
        }
    }

    /// Append a request
    pub fn push(&mut self, request: Request) {
        self.queue.push_back(request);
    }

    /// When the next request becomes due, `None` if the queue is empty
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        if self.queue.is_empty() {
            return None;
        }
        Some(self.ready_at.map_or(now, |ready_at| ready_at.max(now)))
    }

    /// Pop the head request if its turn has come
    pub fn pop_due(&mut self, now: Instant) -> Option<Request> {
        if self.ready_at.is_some_and(|ready_at| now < ready_at) {
            return None;
        }
        let request = self.queue.pop_front()?;
        self.ready_at = Some(now + self.interval);
        Some(request)
    }

    /// Number of queued requests
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug)]
struct Awaiting {
    deadline: Instant,
    responses: usize,
}

/// Queries waiting for a sequenced reply
///
/// Only `ND` and `IC` reads are tracked; everything else is fire and forget.
#[derive(Debug)]
pub struct PendingResponses {
    entries: HashMap<(Option<Address>, String), Awaiting>,
    timeout: Duration,
}

impl PendingResponses {
    /// Create with the given reply timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    fn tracks(request: &Request) -> bool {
        request.is_query() && matches!(request.command.as_str(), "ND" | "IC")
    }

    /// Start waiting for the reply to `request`
    pub fn expect(&mut self, request: &Request, now: Instant) {
        if !Self::tracks(request) {
            return;
        }
        self.entries.insert(
            (request.address.clone(), request.command.clone()),
            Awaiting {
                deadline: now + self.timeout,
                responses: 0,
            },
        );
    }

    /// Match a response against the waiting queries
    ///
    /// Node discovery collects answers until its deadline; any other reply
    /// completes its query. Returns whether the response was awaited.
    pub fn complete(&mut self, response: &CommandResponse) -> bool {
        let key = (response.source.clone(), response.command.clone());
        if response.command == "ND" {
            match self.entries.get_mut(&key) {
                Some(awaiting) => {
                    awaiting.responses += 1;
                    true
                }
                None => false,
            }
        } else {
            self.entries.remove(&key).is_some()
        }
    }

    /// Drop expired entries, returning how many never got a reply
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut unanswered = 0;
        self.entries.retain(|(address, command), awaiting| {
            if now < awaiting.deadline {
                return true;
            }
            if awaiting.responses == 0 {
                let node = address.as_ref().map_or("local", Address::as_str);
                warn!(node, command = command.as_str(), "No response received, giving up");
                unanswered += 1;
            } else {
                debug!(command = command.as_str(), responses = awaiting.responses, "Response window closed");
            }
            false
        });
        unanswered
    }

    /// Number of queries still waiting
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is awaited
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// AT command driving the given pin: `D0`..`D9`, then `P0`..`P2`
pub fn pin_command(number: u8) -> String {
    if number > 9 {
        format!("P{}", number - 10)
    } else {
        format!("D{}", number)
    }
}

/// Output level (4 or 5) for a digital value
fn digital_level(value: &str) -> Option<u8> {
    match value.trim().to_ascii_lowercase().as_str() {
        "0" | "4" | "off" | "low" | "false" => Some(LEVEL_LOW),
        "1" | "5" | "on" | "high" | "true" => Some(LEVEL_HIGH),
        _ => None,
    }
}

/// Pin mode (0..=9) for a configuration value
fn pin_mode(value: &str) -> Option<u8> {
    let value: i64 = value.trim().parse().ok()?;
    u8::try_from(value.rem_euclid(10)).ok()
}

/// Pin number of a writable port below [`PIN_COUNT`]
fn writable_pin(port: &str) -> Result<u8> {
    let kind = PortKind::of(port);
    port_number(port)
        .filter(|&number| kind.is_writable() && number < PIN_COUNT)
        .ok_or_else(|| BridgeError::InvalidPort {
            port: port.to_string(),
            reason: "not a writable pin".to_string(),
        })
}

/// Pin number and level for a set request on `port`
pub fn set_parameters(port: &str, value: &str) -> Result<(u8, u8)> {
    let number = writable_pin(port)?;
    let level = match PortKind::of(port) {
        PortKind::Digital => digital_level(value),
        _ => pin_mode(value),
    };
    let level = level.ok_or_else(|| BridgeError::InvalidValue {
        port: port.to_string(),
        value: value.to_string(),
    })?;
    Ok((number, level))
}

/// Encodes bus requests into radio commands
#[derive(Debug)]
pub struct CommandDispatcher {
    next_frame_id: u8,
    queue: PacedQueue,
    pending: PendingResponses,
    masks: MaskStore,
    change_detection: bool,
    failures: u64,
}

impl CommandDispatcher {
    /// Create a dispatcher
    pub fn new(query_interval: Duration, response_timeout: Duration, change_detection: bool) -> Self {
        Self {
            next_frame_id: 1,
            queue: PacedQueue::new(query_interval),
            pending: PendingResponses::new(response_timeout),
            masks: MaskStore::new(),
            change_detection,
            failures: 0,
        }
    }

    /// Create from bridge settings
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self::new(
            settings.query_interval,
            settings.response_timeout,
            settings.change_detection,
        )
    }

    fn frame_id(&mut self) -> u8 {
        let id = self.next_frame_id;
        // Frame id 0 disables the response
        self.next_frame_id = id.checked_add(1).unwrap_or(1);
        id
    }

    /// Frame and transmit a request, returning whether it was written
    pub async fn transmit<L>(&mut self, link: &mut L, request: Request) -> bool
    where
        L: RadioLink + ?Sized,
    {
        match self.try_transmit(link, request).await {
            Ok(()) => true,
            Err(e) => {
                warn!(code = e.error_code(), error = %e, "Error sending command");
                false
            }
        }
    }

    async fn try_transmit<L>(&mut self, link: &mut L, request: Request) -> Result<()>
    where
        L: RadioLink + ?Sized,
    {
        let now = Instant::now();
        self.pending.expect(&request, now);

        let frame_id = self.frame_id();
        let command = request.into_command(frame_id);
        if let Err(e) = link.send_command(&command).await {
            self.failures += 1;
            return Err(e);
        }
        debug!(command = %command, frame_id, "Command sent");
        Ok(())
    }

    /// Ask the coordinator to discover the network
    pub async fn discover<L>(&mut self, link: &mut L) -> bool
    where
        L: RadioLink + ?Sized,
    {
        info!("Discovering radio nodes");
        self.transmit(link, Request::local("ND")).await
    }

    /// Drive a `dio-` or `pin-` port of a remote node
    ///
    /// Sends the set command, then `WR` (permanent) or `AC` (volatile), then
    /// reads the pin back so the new state is reported on the bus. Returns
    /// `false` when the request cannot be encoded or was not transmitted.
    pub async fn send_message<L>(
        &mut self,
        link: &mut L,
        address: &Address,
        port: &str,
        value: &str,
        permanent: bool,
    ) -> bool
    where
        L: RadioLink + ?Sized,
    {
        match self.try_send_message(link, address, port, value, permanent).await {
            Ok(()) => true,
            Err(e) => {
                warn!(address = %address, port, code = e.error_code(), error = %e, "Set request failed");
                false
            }
        }
    }

    /// [`send_message`](Self::send_message) reporting why it failed
    ///
    /// Rejections are `InvalidPort` or `InvalidValue`; a failed write is
    /// the link's error.
    pub async fn try_send_message<L>(
        &mut self,
        link: &mut L,
        address: &Address,
        port: &str,
        value: &str,
        permanent: bool,
    ) -> Result<()>
    where
        L: RadioLink + ?Sized,
    {
        let (number, level) = set_parameters(port, value)?;

        let command = pin_command(number);
        info!(address = %address, port, command = command.as_str(), level, "Setting pin");

        let sequence = [
            Request::remote(address, command.clone(), Some(vec![level])),
            Request::remote(address, if permanent { "WR" } else { "AC" }, None),
            Request::remote(address, command, None),
        ];
        for request in sequence {
            self.try_transmit(link, request).await?;
        }

        if self.change_detection {
            self.issue_change_detection(address, port, level == LEVEL_HIGH)?;
        }
        Ok(())
    }

    /// Queue reads for the given ports (all pins by default)
    ///
    /// Nothing is sent here; the bridge loop drains the queue.
    pub fn send_query(&mut self, address: &Address, ports: Option<&[String]>) {
        let numbers: Vec<u8> = match ports {
            Some(ports) => ports.iter().filter_map(|port| port_number(port)).collect(),
            None => (0..PIN_COUNT).collect(),
        };
        for number in numbers {
            self.queue
                .push(Request::remote(address, pin_command(number), None));
        }
        if self.change_detection {
            self.queue.push(Request::remote(address, "IC", None));
        }
        debug!(address = %address, queued = self.queue.len(), "Query queued");
    }

    /// Record whether a port's pin should raise change notifications
    ///
    /// Only the desired mask is updated; it is pushed to the node when the
    /// node next reports a different mask. Returns the new mask.
    pub fn issue_change_detection(&mut self, address: &Address, port: &str, enabled: bool) -> Result<u16> {
        let pin = writable_pin(port)?;
        Ok(self.masks.set_pin(address, pin, enabled))
    }

    /// Transmit the queued request if its turn has come
    pub async fn drain_due<L>(&mut self, link: &mut L, now: Instant) -> usize
    where
        L: RadioLink + ?Sized,
    {
        match self.queue.pop_due(now) {
            Some(request) => usize::from(self.transmit(link, request).await),
            None => 0,
        }
    }

    /// When the queue wants to transmit next
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        self.queue.next_deadline(now)
    }

    /// Queue a follow-up request behind any pending queries
    pub fn enqueue(&mut self, request: Request) {
        self.queue.push(request);
    }

    /// Number of queued requests
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Mark a response as received
    pub fn complete(&mut self, response: &CommandResponse) -> bool {
        self.pending.complete(response)
    }

    /// Drop expired queries, returning how many never got a reply
    pub fn expire(&mut self, now: Instant) -> usize {
        self.pending.expire(now)
    }

    /// Number of queries still waiting for a reply
    pub fn awaiting(&self) -> usize {
        self.pending.len()
    }

    /// Desired change-detection masks
    pub fn masks(&self) -> &MaskStore {
        &self.masks
    }

    /// Desired change-detection masks, mutably
    pub fn masks_mut(&mut self) -> &mut MaskStore {
        &mut self.masks
    }

    /// Commands that could not be transmitted
    pub fn failures(&self) -> u64 {
        self.failures
    }
}
