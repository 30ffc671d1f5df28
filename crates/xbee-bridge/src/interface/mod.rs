//! Radio link implementations
//!
//! The bridge never touches the XBee API frame format itself. A radio link
//! delivers decoded [`RadioPacket`] records and accepts [`RadioCommand`]
//! records:
//!
//! - [`tcp::TcpLink`] - JSON-lines over TCP to an external frame decoder
//!   (requires `tcp` feature)
//! - [`crate::test_utils::MockLink`] - in-memory link for tests

#[cfg(feature = "tcp")]
mod tcp;
#[cfg(feature = "tcp")]
pub use tcp::TcpLink;

use crate::error::Result;
use crate::packet::{RadioCommand, RadioPacket};
use async_trait::async_trait;

/// Trait for radio links
///
/// Implementations must make `read_packet` cancel-safe: the bridge polls it
/// inside `tokio::select!` next to its other event sources.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Connect to the radio
    async fn connect(&mut self) -> Result<()>;

    /// Disconnect from the radio
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Read the next decoded packet
    ///
    /// Returns `None` if no packet is available yet.
    /// Returns `Err` on connection/read errors.
    async fn read_packet(&mut self) -> Result<Option<RadioPacket>>;

    /// Send a command record to the radio
    async fn send_command(&mut self, command: &RadioCommand) -> Result<()>;

    /// Get the link name (for logging)
    fn name(&self) -> &str;
}

/// Connection state for links
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}
