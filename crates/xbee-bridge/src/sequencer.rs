//! Response sequencer
//!
//! Command responses drive the follow-up conversation with a node:
//!
//! | Response | Follow-up |
//! |----------|-----------|
//! | `ND` | identify the node, then set its `IR` sample rate |
//! | `IC` | push the desired change-detection mask and `WR` if it differs |
//! | `D<n>` / `P<n>` | report the pin value on `pin-<n>` |
//! | `WR` / `AC` / `IR` | acknowledgement only |
//!
//! The sequencer only decides; the bridge carries out the returned steps.

use tracing::{debug, warn};

use crate::config::{BridgeSettings, PIN_COUNT};
use crate::dispatcher::Request;
use crate::mask::MaskStore;
use crate::packet::{CommandResponse, ResponseData};
use crate::port::Address;

/// Action requested by a command response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerStep {
    /// A node announced itself
    Identified {
        /// Node address
        address: Address,
        /// Node identifier
        alias: String,
    },
    /// A pin reported its configuration value
    PinReport {
        /// Node address
        address: Address,
        /// `pin-<n>` port
        port: String,
        /// Reported value
        value: String,
    },
    /// A command to queue for transmission
    Command(Request),
}

/// Pin number addressed by a `D<n>`/`P<n>` command
pub fn command_pin(command: &str) -> Option<u8> {
    let mut chars = command.chars();
    let offset = match chars.next()? {
        'D' => 0,
        'P' => 10,
        _ => return None,
    };
    let digit = chars.next()?.to_digit(10)?;
    if chars.next().is_some() {
        return None;
    }
    let pin = offset + u8::try_from(digit).ok()?;
    (pin < PIN_COUNT).then_some(pin)
}

/// `IR` parameter for a sample rate in seconds
pub fn sample_rate_parameter(seconds: u32) -> Vec<u8> {
    let millis = u64::from(seconds).saturating_mul(1000);
    let millis = u16::try_from(millis).unwrap_or(u16::MAX);
    millis.to_be_bytes().to_vec()
}

/// State-aware handler for command responses
#[derive(Debug, Clone)]
pub struct ResponseSequencer {
    sample_rate: u32,
    change_detection: bool,
}

impl ResponseSequencer {
    /// Create a sequencer
    pub fn new(sample_rate: u32, change_detection: bool) -> Self {
        Self {
            sample_rate,
            change_detection,
        }
    }

    /// Create from bridge settings
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self::new(settings.sample_rate, settings.change_detection)
    }

    /// Decide what a response leads to
    pub fn handle(&self, response: &CommandResponse, masks: &mut MaskStore) -> Vec<SequencerStep> {
        if !response.status.is_ok() {
            warn!(
                source = ?response.source,
                command = response.command.as_str(),
                status = %response.status,
                "Command failed"
            );
            return Vec::new();
        }

        match response.command.as_str() {
            "ND" => self.on_discovery(response),
            "IC" => self.on_change_detection(response, masks),
            "WR" | "AC" | "IR" => {
                debug!(source = ?response.source, command = response.command.as_str(), "Command acknowledged");
                Vec::new()
            }
            command => match command_pin(command) {
                Some(pin) => Self::on_pin(response, pin),
                None => {
                    warn!("Command response ({}) not implemented", command);
                    Vec::new()
                }
            },
        }
    }

    fn on_discovery(&self, response: &CommandResponse) -> Vec<SequencerStep> {
        let ResponseData::Discovery { address, alias } = &response.data else {
            warn!(data = ?response.data, "Malformed discovery response");
            return Vec::new();
        };
        debug!(address = %address, alias = alias.as_str(), "Node discovered");
        vec![
            SequencerStep::Identified {
                address: address.clone(),
                alias: alias.clone(),
            },
            SequencerStep::Command(Request::remote(
                address,
                "IR",
                Some(sample_rate_parameter(self.sample_rate)),
            )),
        ]
    }

    fn on_change_detection(&self, response: &CommandResponse, masks: &mut MaskStore) -> Vec<SequencerStep> {
        let Some(address) = &response.source else {
            debug!("Ignoring local IC response");
            return Vec::new();
        };
        let Some(reported) = response.data.as_u32() else {
            debug!(address = %address, "IC acknowledged");
            return Vec::new();
        };
        // IC carries at most 16 bits
        let reported = (reported & 0xffff) as u16;

        match masks.reconcile(address, reported) {
            Some(target) if self.change_detection => {
                debug!(address = %address, reported, target, "Pushing change detection mask");
                vec![
                    SequencerStep::Command(Request::remote(
                        address,
                        "IC",
                        Some(target.to_be_bytes().to_vec()),
                    )),
                    SequencerStep::Command(Request::remote(address, "WR", None)),
                ]
            }
            _ => Vec::new(),
        }
    }

    fn on_pin(response: &CommandResponse, pin: u8) -> Vec<SequencerStep> {
        let Some(address) = &response.source else {
            return Vec::new();
        };
        match response.data.as_u32() {
            Some(value) => vec![SequencerStep::PinReport {
                address: address.clone(),
                port: format!("pin-{}", pin),
                value: value.to_string(),
            }],
            None => {
                debug!(address = %address, command = response.command.as_str(), "Command acknowledged");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::CommandStatus;

    fn node() -> Address {
        "0013a20040401122".parse().unwrap()
    }

    fn response(command: &str, status: CommandStatus, data: ResponseData) -> CommandResponse {
        CommandResponse {
            source: Some(node()),
            command: command.to_string(),
            status,
            data,
        }
    }

    fn discovery(status: CommandStatus) -> CommandResponse {
        CommandResponse {
            source: None,
            command: "ND".to_string(),
            status,
            data: ResponseData::Discovery {
                address: node(),
                alias: "garden".to_string(),
            },
        }
    }

    #[test]
    fn test_command_pin() {
        assert_eq!(command_pin("D0"), Some(0));
        assert_eq!(command_pin("D9"), Some(9));
        assert_eq!(command_pin("P2"), Some(12));
        assert_eq!(command_pin("P3"), None);
        assert_eq!(command_pin("IC"), None);
        assert_eq!(command_pin("D10"), None);
    }

    #[test]
    fn test_sample_rate_parameter() {
        assert_eq!(sample_rate_parameter(0), vec![0, 0]);
        assert_eq!(sample_rate_parameter(5), vec![0x13, 0x88]);
        assert_eq!(sample_rate_parameter(3600), vec![0xff, 0xff]);
    }

    #[test]
    fn test_discovery_identifies_and_sets_rate() {
        let sequencer = ResponseSequencer::new(5, false);
        let steps = sequencer.handle(&discovery(CommandStatus::Ok), &mut MaskStore::new());

        assert_eq!(
            steps,
            vec![
                SequencerStep::Identified {
                    address: node(),
                    alias: "garden".to_string(),
                },
                SequencerStep::Command(Request::remote(&node(), "IR", Some(vec![0x13, 0x88]))),
            ]
        );
    }

    #[test]
    fn test_failed_discovery_does_nothing() {
        let sequencer = ResponseSequencer::new(5, false);
        let steps = sequencer.handle(&discovery(CommandStatus::Error), &mut MaskStore::new());
        assert!(steps.is_empty());
    }

    #[test]
    fn test_pin_report() {
        let sequencer = ResponseSequencer::new(0, false);
        let mut masks = MaskStore::new();

        let steps = sequencer.handle(
            &response("P1", CommandStatus::Ok, ResponseData::Bytes(vec![5])),
            &mut masks,
        );
        assert_eq!(
            steps,
            vec![SequencerStep::PinReport {
                address: node(),
                port: "pin-11".to_string(),
                value: "5".to_string(),
            }]
        );

        // Set acknowledgement carries no value
        let steps = sequencer.handle(&response("D3", CommandStatus::Ok, ResponseData::Empty), &mut masks);
        assert!(steps.is_empty());
    }

    #[test]
    fn test_ic_adopts_reported_mask() {
        let sequencer = ResponseSequencer::new(0, true);
        let mut masks = MaskStore::new();

        let steps = sequencer.handle(
            &response("IC", CommandStatus::Ok, ResponseData::Bytes(vec![0x00, 0x06])),
            &mut masks,
        );
        assert!(steps.is_empty());
        assert_eq!(masks.get(&node()), Some(6));
    }

    #[test]
    fn test_ic_pushes_differing_mask() {
        let sequencer = ResponseSequencer::new(0, true);
        let mut masks = MaskStore::new();
        masks.set_pin(&node(), 3, true);

        let steps = sequencer.handle(
            &response("IC", CommandStatus::Ok, ResponseData::Bytes(vec![0x00, 0x00])),
            &mut masks,
        );
        assert_eq!(
            steps,
            vec![
                SequencerStep::Command(Request::remote(&node(), "IC", Some(vec![0x00, 0x08]))),
                SequencerStep::Command(Request::remote(&node(), "WR", None)),
            ]
        );
    }

    #[test]
    fn test_ic_without_change_detection() {
        let sequencer = ResponseSequencer::new(0, false);
        let mut masks = MaskStore::new();
        masks.set(&node(), 0b1000);

        let steps = sequencer.handle(
            &response("IC", CommandStatus::Ok, ResponseData::Bytes(vec![0x00])),
            &mut masks,
        );
        assert!(steps.is_empty());
    }

    #[test]
    fn test_unknown_response() {
        let sequencer = ResponseSequencer::new(0, false);
        let steps = sequencer.handle(
            &response("VR", CommandStatus::Ok, ResponseData::Bytes(vec![0x10])),
            &mut MaskStore::new(),
        );
        assert!(steps.is_empty());
    }
}
