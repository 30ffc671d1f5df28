//! XBee Radio Mesh Bridge for MQTT-style Pub/Sub Buses
//!
//! This crate bridges a mesh of XBee radio nodes and a publish/subscribe
//! bus. Values reported by the nodes (serial lines, IO samples, pin
//! configuration) are published on bus topics; messages on `/set` topics
//! drive the nodes' digital lines.
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Radio Link** - JSON-lines TCP connection to an XBee frame decoder
//! 2. **Packet Handling** - classification, line reassembly, response sequencing
//! 3. **Routing** - static routes and topic patterns, duplicate filtering
//! 4. **Command Dispatch** - set/persist/read-back sequences and paced queries
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use xbee_bridge::{BridgeConfigBuilder, TcpLink, XBeeBridge};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfigBuilder::new()
//!         .radio_address("127.0.0.1:9750")
//!         .route("0013a20040401122", "temp", "/home/garden/temperature")
//!         .build();
//!
//!     let link = TcpLink::new(&config.radio.address);
//!     let bus = Arc::new(my_mqtt_client());
//!
//!     let (bridge, handle) = XBeeBridge::new(link, &config.general, bus)?;
//!     tokio::spawn(bridge.run());
//!
//!     // Feed bus messages in
//!     handle.bus_message("/home/garden/pump/set", "1").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `tcp` - JSON-lines TCP radio link (default)
//!
//! # Topics
//!
//! Unrouted ports get topics from `default_topic_pattern`:
//!
//! | Pattern | Port | Topic |
//! |---------|------|-------|
//! | `/raw/xbee/{address}/{port}` | `dio-3` | `raw/xbee/0013a20040401122/dio-3` |
//! | `/raw/xbee/{address}/{item}/{port}` | `adc-5` | `raw/xbee/0013a20040401122/analog/adc-5` |
//!
//! Writing `1` to `raw/xbee/0013a20040401122/dio-3/set` sends `D3=5`, `WR`
//! and a `D3` read-back to the node.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod interface;
pub mod packet;
pub mod port;

// Bridge components
pub mod cache;
pub mod dispatcher;
pub mod mapper;
pub mod mask;
pub mod reassembly;
pub mod sequencer;

// Service
pub mod bridge;
pub mod bus;

// Testing utilities
pub mod test_utils;

// Re-exports for convenience
pub use config::{
    BridgeConfigBuilder, BridgeSettings, MqttConfig, RadioConfig, ReconnectConfig, RouteTable,
    XBeeBridgeConfig,
};
pub use error::{BridgeError, Result};
pub use interface::{ConnectionState, RadioLink};
pub use packet::{
    classify, Classified, CommandResponse, CommandStatus, RadioCommand, RadioPacket, SampleValue,
};
pub use port::{Address, PortKind};

#[cfg(feature = "tcp")]
pub use interface::TcpLink;

pub use cache::{DuplicateFilter, FilterStats};
pub use dispatcher::{CommandDispatcher, PacedQueue, Request};
pub use mapper::{RoutingTable, TopicPattern};
pub use mask::MaskStore;
pub use reassembly::ReassemblyBuffer;
pub use sequencer::{ResponseSequencer, SequencerStep};

pub use bridge::{BridgeCommand, BridgeHandle, BridgeStats, XBeeBridge};
pub use bus::{BusClient, BusMessage};

pub use test_utils::{MockLink, MockLinkHandle, RecordingBus};

// Protocol constants re-exports
pub use config::{DEFAULT_DUPLICATE_WINDOW_SECS, DEFAULT_MQTT_PORT, DEFAULT_TOPIC_PATTERN, PIN_COUNT};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
