//! Radio packet records and their classification
//!
//! The radio link hands the bridge already-decoded API frames. They are
//! modelled after the python-xbee frame dictionaries, keyed by `id`:
//!
//! | id | Frame |
//! |----|-------|
//! | `rx` | ZigBee Receive Packet (0x90) |
//! | `rx_io_data_long_addr` | IO Data Sample Rx Indicator (0x92) |
//! | `node_id_indicator` | Node Identification Indicator (0x95) |
//! | `at_response` | Local AT Command Response (0x88) |
//! | `remote_at_response` | Remote AT Command Response (0x97) |
//!
//! [`classify`] validates a record and turns it into a [`Classified`]
//! packet the bridge can act on. Outgoing requests are [`RadioCommand`]s.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{BridgeError, Result};
use crate::port::{Address, PortKind};

/// Value of a single IO sample line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    /// Digital line state
    Digital(bool),
    /// Analog reading
    Analog(i64),
}

impl SampleValue {
    /// Digital level as 0/1
    pub fn as_level(&self) -> u8 {
        match self {
            SampleValue::Digital(state) => u8::from(*state),
            SampleValue::Analog(value) => u8::from(*value != 0),
        }
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleValue::Digital(state) => write!(f, "{}", u8::from(*state)),
            SampleValue::Analog(value) => write!(f, "{}", value),
        }
    }
}

/// Node discovery answer carried in an `ND` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    /// Discovered node address (hex)
    pub source_addr_long: String,
    /// Node identifier string
    #[serde(default)]
    pub node_identifier: String,
}

/// Parameter of an AT command response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseParameter {
    /// Parsed `ND` answer
    Discovery(DiscoveryRecord),
    /// Raw parameter bytes (hex)
    Raw(String),
}

/// Decoded API frame as delivered by the radio link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum RadioPacket {
    /// Data sent through the serial port of a remote radio
    #[serde(rename = "rx")]
    DataReceived {
        /// Sender address (hex)
        source_addr_long: Option<String>,
        /// Received payload
        rf_data: String,
    },
    /// Periodic or change-triggered IO sample
    #[serde(rename = "rx_io_data_long_addr")]
    IoSample {
        /// Sender address (hex)
        source_addr_long: Option<String>,
        /// Port → value maps, one per sample
        #[serde(default)]
        samples: Vec<BTreeMap<String, SampleValue>>,
    },
    /// A node announced itself
    #[serde(rename = "node_id_indicator")]
    NodeIdentification {
        /// Sender address (hex)
        source_addr_long: Option<String>,
        /// Node identifier string
        #[serde(default)]
        node_id: String,
    },
    /// Response to a command sent to the local coordinator
    #[serde(rename = "at_response")]
    LocalCommandResponse {
        /// Two-letter AT command
        command: String,
        /// Status byte
        status: u8,
        /// Optional response parameter
        #[serde(default)]
        parameter: Option<ResponseParameter>,
    },
    /// Response to a command sent to a remote node
    #[serde(rename = "remote_at_response")]
    RemoteCommandResponse {
        /// Responding node address (hex)
        source_addr_long: Option<String>,
        /// Two-letter AT command
        command: String,
        /// Status byte
        status: u8,
        /// Optional response parameter
        #[serde(default)]
        parameter: Option<ResponseParameter>,
    },
    /// Any frame type the bridge does not handle
    #[serde(other)]
    Unknown,
}

/// AT command response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Command accepted
    Ok,
    /// Generic error
    Error,
    /// Command not recognised
    InvalidCommand,
    /// Parameter rejected
    InvalidParameter,
    /// Remote command could not be delivered
    TxFailure,
    /// Status byte not documented
    Unknown(u8),
}

impl From<u8> for CommandStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => CommandStatus::Ok,
            1 => CommandStatus::Error,
            2 => CommandStatus::InvalidCommand,
            3 => CommandStatus::InvalidParameter,
            4 => CommandStatus::TxFailure,
            other => CommandStatus::Unknown(other),
        }
    }
}

impl CommandStatus {
    /// Whether the command succeeded
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandStatus::Ok)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Ok => write!(f, "OK"),
            CommandStatus::Error => write!(f, "ERROR"),
            CommandStatus::InvalidCommand => write!(f, "Invalid Command"),
            CommandStatus::InvalidParameter => write!(f, "Invalid Parameter"),
            CommandStatus::TxFailure => write!(f, "Tx Failure"),
            CommandStatus::Unknown(_) => write!(f, "Unknown"),
        }
    }
}

/// Payload of a command response after validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    /// No parameter
    Empty,
    /// Raw parameter bytes
    Bytes(Vec<u8>),
    /// Node discovery answer
    Discovery {
        /// Discovered node
        address: Address,
        /// Its node identifier
        alias: String,
    },
}

impl ResponseData {
    /// Parameter bytes interpreted as a big-endian unsigned integer
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            ResponseData::Bytes(bytes) if !bytes.is_empty() && bytes.len() <= 4 => Some(
                bytes
                    .iter()
                    .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte)),
            ),
            _ => None,
        }
    }
}

/// A command response ready for the sequencer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Responding node, `None` for the local coordinator
    pub source: Option<Address>,
    /// Two-letter AT command
    pub command: String,
    /// Response status
    pub status: CommandStatus,
    /// Response payload
    pub data: ResponseData,
}

impl CommandResponse {
    /// Whether this came from a remote node
    pub fn is_remote(&self) -> bool {
        self.source.is_some()
    }
}

/// Result of classifying a [`RadioPacket`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Serial data to be reassembled into lines
    DataStream {
        /// Sender
        source: Address,
        /// Received fragment
        data: String,
    },
    /// IO sample values, `dio-` values already normalized to 0/1
    IoSample {
        /// Sender
        source: Address,
        /// (port, value) pairs in sample order
        values: Vec<(String, String)>,
    },
    /// Node identification
    NodeIdentification {
        /// Sender
        source: Address,
        /// Node identifier
        alias: String,
    },
    /// Response from the local coordinator
    LocalCommandResponse(CommandResponse),
    /// Response from a remote node
    RemoteCommandResponse(CommandResponse),
    /// Unsupported or malformed packet
    Unknown {
        /// Error code of the rejection
        code: &'static str,
        /// Why it was not classified
        reason: String,
    },
}

impl From<BridgeError> for Classified {
    fn from(err: BridgeError) -> Self {
        Classified::Unknown {
            code: err.error_code(),
            reason: err.to_string(),
        }
    }
}

/// Validate and classify a packet record
pub fn classify(packet: RadioPacket) -> Classified {
    match packet {
        RadioPacket::DataReceived {
            source_addr_long,
            rf_data,
        } => match parse_source(source_addr_long.as_deref()) {
            Ok(source) => Classified::DataStream {
                source,
                data: rf_data,
            },
            Err(e) => e.into(),
        },
        RadioPacket::IoSample {
            source_addr_long,
            samples,
        } => match parse_source(source_addr_long.as_deref()) {
            Ok(source) => {
                let values = samples
                    .into_iter()
                    .flat_map(|sample| sample.into_iter())
                    .map(|(port, value)| {
                        let value = if PortKind::of(&port) == PortKind::Digital {
                            value.as_level().to_string()
                        } else {
                            value.to_string()
                        };
                        (port, value)
                    })
                    .collect();
                Classified::IoSample { source, values }
            }
            Err(e) => e.into(),
        },
        RadioPacket::NodeIdentification {
            source_addr_long,
            node_id,
        } => match parse_source(source_addr_long.as_deref()) {
            Ok(source) => Classified::NodeIdentification {
                source,
                alias: node_id,
            },
            Err(e) => e.into(),
        },
        RadioPacket::LocalCommandResponse {
            command,
            status,
            parameter,
        } => match parse_parameter(parameter) {
            Ok(data) => Classified::LocalCommandResponse(CommandResponse {
                source: None,
                command,
                status: status.into(),
                data,
            }),
            Err(e) => e.into(),
        },
        RadioPacket::RemoteCommandResponse {
            source_addr_long,
            command,
            status,
            parameter,
        } => {
            let parsed = parse_source(source_addr_long.as_deref())
                .and_then(|source| parse_parameter(parameter).map(|data| (source, data)));
            match parsed {
                Ok((source, data)) => Classified::RemoteCommandResponse(CommandResponse {
                    source: Some(source),
                    command,
                    status: status.into(),
                    data,
                }),
                Err(e) => e.into(),
            }
        }
        RadioPacket::Unknown => {
            BridgeError::InvalidPacket("unsupported frame type".to_string()).into()
        }
    }
}

fn parse_source(source: Option<&str>) -> Result<Address> {
    source
        .ok_or_else(|| BridgeError::InvalidPacket("missing source address".to_string()))?
        .parse()
}

fn parse_parameter(parameter: Option<ResponseParameter>) -> Result<ResponseData> {
    match parameter {
        None => Ok(ResponseData::Empty),
        Some(ResponseParameter::Raw(raw)) if raw.is_empty() => Ok(ResponseData::Empty),
        Some(ResponseParameter::Raw(raw)) => hex::decode(&raw)
            .map(ResponseData::Bytes)
            .map_err(|_| BridgeError::InvalidPacket(format!("invalid parameter {:?}", raw))),
        Some(ResponseParameter::Discovery(record)) => {
            let address = parse_source(Some(&record.source_addr_long))?;
            Ok(ResponseData::Discovery {
                address,
                alias: record.node_identifier,
            })
        }
    }
}

/// Request sent to the radio link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum RadioCommand {
    /// AT command for the local coordinator
    At {
        /// Two-letter AT command
        command: String,
        /// Optional parameter bytes
        #[serde(with = "hex_parameter", default)]
        parameter: Option<Vec<u8>>,
        /// Frame id used to correlate the response
        frame_id: u8,
    },
    /// AT command for a remote node
    RemoteAt {
        /// Target node
        dest_addr_long: Address,
        /// Two-letter AT command
        command: String,
        /// Optional parameter bytes
        #[serde(with = "hex_parameter", default)]
        parameter: Option<Vec<u8>>,
        /// Frame id used to correlate the response
        frame_id: u8,
    },
}

impl RadioCommand {
    /// Two-letter AT command
    pub fn command(&self) -> &str {
        match self {
            RadioCommand::At { command, .. } | RadioCommand::RemoteAt { command, .. } => command,
        }
    }

    /// Parameter bytes, if any
    pub fn parameter(&self) -> Option<&[u8]> {
        match self {
            RadioCommand::At { parameter, .. } | RadioCommand::RemoteAt { parameter, .. } => {
                parameter.as_deref()
            }
        }
    }

    /// Target node for remote commands
    pub fn destination(&self) -> Option<&Address> {
        match self {
            RadioCommand::At { .. } => None,
            RadioCommand::RemoteAt { dest_addr_long, .. } => Some(dest_addr_long),
        }
    }
}

impl fmt::Display for RadioCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self
            .destination()
            .map(Address::as_str)
            .unwrap_or("local");
        match self.parameter() {
            Some(parameter) => write!(
                f,
                "{} {}={}",
                target,
                self.command(),
                hex::encode(parameter)
            ),
            None => write!(f, "{} {}", target, self.command()),
        }
    }
}

mod hex_parameter {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
