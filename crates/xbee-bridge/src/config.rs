//! Configuration types for the XBee bridge
//!
//! This module provides configuration structures for the bridge including
//! routing, topic patterns, radio link and MQTT broker settings. The layout
//! mirrors the YAML file read by the daemon:
//!
//! ```yaml
//! general:
//!   sample_rate: 60
//!   change_detection: true
//!   duplicate_check_window: 5s
//!   default_topic_pattern: "/raw/xbee/{address}/{port}"
//!   routes:
//!     "0013a20040401122":
//!       serial: /home/outside/temperature
//! radio:
//!   address: 127.0.0.1:9750
//! mqtt:
//!   host: localhost
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Default topic pattern for ports without a static route
pub const DEFAULT_TOPIC_PATTERN: &str = "/raw/xbee/{address}/{port}";

/// Default name for the raw serial stream port
pub const DEFAULT_PORT_NAME: &str = "serial";

/// Default window during which identical values are not re-published
pub const DEFAULT_DUPLICATE_WINDOW_SECS: u64 = 5;

/// Number of addressable digital pins (`pin-0` .. `pin-12`)
pub const PIN_COUNT: u8 = 13;

/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Static route table: address → port → topic
pub type RouteTable = BTreeMap<String, BTreeMap<String, String>>;

/// Main configuration for the bridge daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XBeeBridgeConfig {
    /// Bridge behavior settings
    #[serde(default)]
    pub general: BridgeSettings,

    /// Radio link settings
    #[serde(default)]
    pub radio: RadioConfig,

    /// MQTT broker settings
    #[serde(default)]
    pub mqtt: MqttConfig,
}

/// Bridge behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Port name used for serial lines without a `port:` prefix
    #[serde(default = "default_port_name")]
    pub default_port_name: String,

    /// IO sample rate pushed to discovered nodes, in seconds (0 disables)
    #[serde(default)]
    pub sample_rate: u32,

    /// Keep the remote change-detection mask in sync with the bridge
    #[serde(default)]
    pub change_detection: bool,

    /// Window during which an unchanged value is not re-published
    #[serde(with = "humantime_serde", default = "default_duplicate_window")]
    pub duplicate_check_window: Duration,

    /// Maximum number of topics tracked by the duplicate filter
    #[serde(default = "default_duplicate_cache_size")]
    pub duplicate_cache_size: usize,

    /// Outbound topic template (`{address}`, `{port}`, optional `{item}`)
    #[serde(default = "default_topic_pattern")]
    pub default_topic_pattern: String,

    /// Inbound topic template; defaults to the outbound one plus `/set`
    #[serde(default)]
    pub default_input_topic_pattern: Option<String>,

    /// Synthesize topics for ports that have no static route
    #[serde(default = "default_true", alias = "publish_undefined_topics")]
    pub expose_undefined_topics: bool,

    /// Broadcast a node discovery once the radio link is up
    #[serde(default = "default_true")]
    pub discovery_on_connect: bool,

    /// Static routes
    #[serde(default)]
    pub routes: RouteTable,

    /// Upper bound for unterminated serial data kept per node
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,

    /// Minimum gap between queued query commands
    #[serde(with = "humantime_serde", default = "default_query_interval")]
    pub query_interval: Duration,

    /// How long a sequenced query may wait for its response
    #[serde(with = "humantime_serde", default = "default_response_timeout")]
    pub response_timeout: Duration,

    /// Interval of the housekeeping sweep
    #[serde(with = "humantime_serde", default = "default_housekeeping_interval")]
    pub housekeeping_interval: Duration,

    /// Radio link reconnection after a connection loss
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_port_name() -> String {
    DEFAULT_PORT_NAME.to_string()
}

fn default_duplicate_window() -> Duration {
    Duration::from_secs(DEFAULT_DUPLICATE_WINDOW_SECS)
}

fn default_duplicate_cache_size() -> usize {
    1024
}

fn default_topic_pattern() -> String {
    DEFAULT_TOPIC_PATTERN.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_pending_bytes() -> usize {
    1024
}

fn default_query_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_housekeeping_interval() -> Duration {
    Duration::from_secs(10)
}

impl BridgeSettings {
    /// Inbound topic template, falling back to `<default_topic_pattern>/set`
    pub fn input_topic_pattern(&self) -> String {
        self.default_input_topic_pattern
            .clone()
            .unwrap_or_else(|| format!("{}/set", self.default_topic_pattern))
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            default_port_name: default_port_name(),
            sample_rate: 0,
            change_detection: false,
            duplicate_check_window: default_duplicate_window(),
            duplicate_cache_size: default_duplicate_cache_size(),
            default_topic_pattern: default_topic_pattern(),
            default_input_topic_pattern: None,
            expose_undefined_topics: true,
            discovery_on_connect: true,
            routes: RouteTable::new(),
            max_pending_bytes: default_max_pending_bytes(),
            query_interval: default_query_interval(),
            response_timeout: default_response_timeout(),
            housekeeping_interval: default_housekeeping_interval(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Reconnection behavior configuration
///
/// Only applies to a link lost while running; a failed first connection
/// still aborts the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay before the first reconnection attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Maximum number of reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based), doubling up to `max_delay`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether another attempt may follow `attempt`
    pub fn allows_after(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_attempts: 0,
        }
    }
}

/// Radio link configuration
///
/// The bridge talks to an external frame decoder that exchanges one JSON
/// record per line over TCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Decoder address (`host:port`)
    #[serde(default = "default_radio_address")]
    pub address: String,
}

fn default_radio_address() -> String {
    "127.0.0.1:9750".to_string()
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            address: default_radio_address(),
        }
    }
}

/// MQTT broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Optional username
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive: Duration,

    /// Start with a clean session
    #[serde(default)]
    pub clean_session: bool,

    /// QoS used for publish and subscribe (0, 1 or 2)
    #[serde(default)]
    pub qos: u8,

    /// Publish with the retain flag
    #[serde(default = "default_true")]
    pub retain: bool,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_client_id() -> String {
    "xbee2mqtt".to_string()
}

fn default_keepalive() -> Duration {
    Duration::from_secs(60)
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: DEFAULT_MQTT_PORT,
            client_id: default_client_id(),
            username: None,
            password: None,
            keepalive: default_keepalive(),
            clean_session: false,
            qos: 0,
            retain: true,
        }
    }
}

/// Builder for XBeeBridgeConfig
#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    config: XBeeBridgeConfig,
}

impl BridgeConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the IO sample rate in seconds
    pub fn sample_rate(mut self, seconds: u32) -> Self {
        self.config.general.sample_rate = seconds;
        self
    }

    /// Enable or disable change-detection mask synchronization
    pub fn change_detection(mut self, enabled: bool) -> Self {
        self.config.general.change_detection = enabled;
        self
    }

    /// Set the duplicate check window
    pub fn duplicate_window(mut self, window: Duration) -> Self {
        self.config.general.duplicate_check_window = window;
        self
    }

    /// Set the outbound topic pattern
    pub fn topic_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.general.default_topic_pattern = pattern.into();
        self
    }

    /// Set the inbound topic pattern
    pub fn input_topic_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.general.default_input_topic_pattern = Some(pattern.into());
        self
    }

    /// Enable or disable topics for unrouted ports
    pub fn expose_undefined_topics(mut self, enabled: bool) -> Self {
        self.config.general.expose_undefined_topics = enabled;
        self
    }

    /// Enable or disable discovery on connect
    pub fn discovery_on_connect(mut self, enabled: bool) -> Self {
        self.config.general.discovery_on_connect = enabled;
        self
    }

    /// Set the gap between queued queries
    pub fn query_interval(mut self, interval: Duration) -> Self {
        self.config.general.query_interval = interval;
        self
    }

    /// Set the reconnection behavior
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.general.reconnect = reconnect;
        self
    }

    /// Add a static route
    pub fn route(
        mut self,
        address: impl Into<String>,
        port: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        self.config
            .general
            .routes
            .entry(address.into())
            .or_default()
            .insert(port.into(), topic.into());
        self
    }

    /// Set the radio link address
    pub fn radio_address(mut self, address: impl Into<String>) -> Self {
        self.config.radio.address = address.into();
        self
    }

    /// Set the MQTT broker host and port
    pub fn mqtt_broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.mqtt.host = host.into();
        self.config.mqtt.port = port;
        self
    }

    /// Build the configuration
    pub fn build(self) -> XBeeBridgeConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime; plain integers are seconds
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => humantime::parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}
