//! Radio addresses and port names
//!
//! A node is addressed by its 64-bit hardware address, carried around as a
//! 16 character lowercase hex string. Ports are plain strings whose first
//! four characters select the kind of I/O line (`pin-`, `dio-`, `adc-`);
//! anything else is a pseudo-port such as `serial`, `seen` or `alias`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Length of an encoded address in hex characters
pub const ADDRESS_HEX_LEN: usize = 16;

/// 64-bit radio node address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Build an address from its raw bytes
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Address as a hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw address bytes
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        // Validated on construction
        if hex::decode_to_slice(&self.0, &mut out).is_err() {
            out = [0u8; 8];
        }
        out
    }
}

impl FromStr for Address {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        if normalized.len() != ADDRESS_HEX_LEN || hex::decode(&normalized).is_err() {
            return Err(BridgeError::InvalidAddress(s.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for Address {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of port, decided by its 4-character prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// `pin-N`: configured mode of a physical pin
    Pin,
    /// `dio-N`: digital line
    Digital,
    /// `adc-N`: analog input
    Analog,
    /// Anything else (`serial`, `seen`, `alias`, ...)
    Other,
}

impl PortKind {
    /// Classify a port name
    pub fn of(port: &str) -> Self {
        match port_prefix(port) {
            "pin-" => PortKind::Pin,
            "dio-" => PortKind::Digital,
            "adc-" => PortKind::Analog,
            _ => PortKind::Other,
        }
    }

    /// Port prefix for this kind
    pub fn prefix(&self) -> &'static str {
        match self {
            PortKind::Pin => "pin-",
            PortKind::Digital => "dio-",
            PortKind::Analog => "adc-",
            PortKind::Other => "",
        }
    }

    /// Item name used by `{item}` topic patterns
    pub fn item(&self) -> &'static str {
        match self {
            PortKind::Pin => "config",
            PortKind::Digital => "digital",
            PortKind::Analog => "analog",
            PortKind::Other => "",
        }
    }

    /// Reverse of [`PortKind::item`]
    pub fn from_item(item: &str) -> Self {
        match item {
            "config" => PortKind::Pin,
            "digital" => PortKind::Digital,
            "analog" => PortKind::Analog,
            _ => PortKind::Other,
        }
    }

    /// Whether the bridge can drive this port from the bus
    pub fn is_writable(&self) -> bool {
        matches!(self, PortKind::Pin | PortKind::Digital)
    }
}

/// First four characters of a port name (or the whole name if shorter)
pub fn port_prefix(port: &str) -> &str {
    port.get(..4).unwrap_or(port)
}

/// Everything after the 4-character prefix
pub fn port_suffix(port: &str) -> &str {
    port.get(4..).unwrap_or("")
}

/// Pin number of a `pin-`/`dio-`/`adc-` port
pub fn port_number(port: &str) -> Option<u8> {
    if PortKind::of(port) == PortKind::Other {
        return None;
    }
    port_suffix(port).parse().ok()
}

/// Replace the prefix of a port, keeping its number
pub fn with_kind(port: &str, kind: PortKind) -> String {
    format!("{}{}", kind.prefix(), port_suffix(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let address: Address = "0013A20040401122".parse().unwrap();
        assert_eq!(address.as_str(), "0013a20040401122");
        assert_eq!(
            address.to_bytes(),
            [0x00, 0x13, 0xa2, 0x00, 0x40, 0x40, 0x11, 0x22]
        );
        assert_eq!(Address::from_bytes(address.to_bytes()), address);
    }

    #[test]
    fn test_address_rejects_bad_input() {
        assert!("0013a200".parse::<Address>().is_err());
        assert!("0013a2004040112z".parse::<Address>().is_err());
        assert!("".parse::<Address>().is_err());
    }

    #[test]
    fn test_port_kinds() {
        assert_eq!(PortKind::of("pin-12"), PortKind::Pin);
        assert_eq!(PortKind::of("dio-3"), PortKind::Digital);
        assert_eq!(PortKind::of("adc-0"), PortKind::Analog);
        assert_eq!(PortKind::of("serial"), PortKind::Other);
        assert_eq!(PortKind::of("seen"), PortKind::Other);
        assert!(PortKind::Digital.is_writable());
        assert!(!PortKind::Analog.is_writable());
    }

    #[test]
    fn test_port_numbers() {
        assert_eq!(port_number("pin-12"), Some(12));
        assert_eq!(port_number("dio-0"), Some(0));
        assert_eq!(port_number("serial"), None);
        assert_eq!(port_number("dio-x"), None);
        assert_eq!(with_kind("adc-5", PortKind::Pin), "pin-5");
    }

    #[test]
    fn test_item_mapping() {
        for kind in [PortKind::Pin, PortKind::Digital, PortKind::Analog] {
            assert_eq!(PortKind::from_item(kind.item()), kind);
        }
        assert_eq!(PortKind::from_item(""), PortKind::Other);
    }
}
