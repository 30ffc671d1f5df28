//! Error types for XBee bridge operations
//!
//! Errors are grouped the same way the bridge reacts to them: link and bus
//! failures may be retried, malformed input is logged and dropped, and
//! configuration problems abort startup.

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Radio Link Errors =====
    /// Radio link could not be established
    #[error("Failed to connect radio link {link}: {reason}")]
    LinkConnectFailed {
        /// Link name
        link: String,
        /// Failure reason
        reason: String,
    },

    /// Radio link read error
    #[error("Radio link read error: {0}")]
    ReadError(String),

    /// Radio link write error
    #[error("Radio link write error: {0}")]
    WriteError(String),

    /// Radio link disconnected
    #[error("Radio link disconnected")]
    Disconnected,

    // ===== Bus Errors =====
    /// Publish to the message bus failed
    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed {
        /// Target topic
        topic: String,
        /// Failure reason
        reason: String,
    },

    /// Subscribe on the message bus failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    // ===== Input Errors =====
    /// Address is not an 8-byte hex identifier
    #[error("Invalid radio address: {0}")]
    InvalidAddress(String),

    /// Port name is not usable for the requested operation
    #[error("Invalid port {port}: {reason}")]
    InvalidPort {
        /// Port name
        port: String,
        /// Why it was rejected
        reason: String,
    },

    /// Value could not be converted for the radio
    #[error("Invalid value {value:?} for port {port}")]
    InvalidValue {
        /// Port name
        port: String,
        /// Offending value
        value: String,
    },

    /// Packet record could not be decoded
    #[error("Invalid packet record: {0}")]
    InvalidPacket(String),

    /// Topic matched neither a route nor the input pattern
    #[error("No route for topic: {0}")]
    NoRoute(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::Disconnected
                | BridgeError::ReadError(_)
                | BridgeError::WriteError(_)
                | BridgeError::PublishFailed { .. }
                | BridgeError::SubscribeFailed(_)
        )
    }

    /// Check if this is an input error (bad data from the radio or bus)
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidAddress(_)
                | BridgeError::InvalidPort { .. }
                | BridgeError::InvalidValue { .. }
                | BridgeError::InvalidPacket(_)
                | BridgeError::NoRoute(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::LinkConnectFailed { .. } => "LINK_CONNECT_FAILED",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::WriteError(_) => "WRITE_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::PublishFailed { .. } => "PUBLISH_FAILED",
            BridgeError::SubscribeFailed(_) => "SUBSCRIBE_FAILED",
            BridgeError::InvalidAddress(_) => "INVALID_ADDRESS",
            BridgeError::InvalidPort { .. } => "INVALID_PORT",
            BridgeError::InvalidValue { .. } => "INVALID_VALUE",
            BridgeError::InvalidPacket(_) => "INVALID_PACKET",
            BridgeError::NoRoute(_) => "NO_ROUTE",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
            BridgeError::Json(_) => "JSON_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
