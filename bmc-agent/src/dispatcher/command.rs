//! Machine commands as delivered on the command channel

use crate::oob::BmcDetails;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid command payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("update_firmware command without firmware details")]
    MissingFirmware,
}

/// What the agent is asked to do with one machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineCommand {
    PowerOn,
    PowerOff,
    PowerReset,
    PowerCycle,
    BootToBios,
    BootFromDisk,
    BootFromPxe,
    /// PXE boot followed by a power cycle
    Reinstall,
    IdentifyLedOn,
    IdentifyLedOff,
    /// `kind` is validated by the dispatcher, not the decoder
    UpdateFirmware { kind: String, url: String },
    /// PXE boot followed by a power reset
    Deleted,
    /// Boot from disk
    Created,
    Unhandled(String),
}

impl MachineCommand {
    pub fn name(&self) -> &str {
        match self {
            MachineCommand::PowerOn => "power_on",
            MachineCommand::PowerOff => "power_off",
            MachineCommand::PowerReset => "power_reset",
            MachineCommand::PowerCycle => "power_cycle",
            MachineCommand::BootToBios => "boot_to_bios",
            MachineCommand::BootFromDisk => "boot_from_disk",
            MachineCommand::BootFromPxe => "boot_from_pxe",
            MachineCommand::Reinstall => "reinstall",
            MachineCommand::IdentifyLedOn => "identify_led_on",
            MachineCommand::IdentifyLedOff => "identify_led_off",
            MachineCommand::UpdateFirmware { .. } => "update_firmware",
            MachineCommand::Deleted => "machine_deleted",
            MachineCommand::Created => "machine_created",
            MachineCommand::Unhandled(name) => name,
        }
    }
}

impl fmt::Display for MachineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRequest {
    pub kind: String,
    pub url: String,
}

/// Wire shape of a command message
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandMessage {
    pub machine_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmc: Option<BmcDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<FirmwareRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub machine_id: String,
    pub command: MachineCommand,
    pub bmc: Option<BmcDetails>,
}

impl CommandEnvelope {
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let message: CommandMessage = serde_json::from_slice(payload)?;

        let command = match message.command.to_ascii_lowercase().as_str() {
            "power_on" | "on" => MachineCommand::PowerOn,
            "power_off" | "off" => MachineCommand::PowerOff,
            "power_reset" | "reset" => MachineCommand::PowerReset,
            "power_cycle" | "cycle" => MachineCommand::PowerCycle,
            "boot_to_bios" => MachineCommand::BootToBios,
            "boot_from_disk" => MachineCommand::BootFromDisk,
            "boot_from_pxe" => MachineCommand::BootFromPxe,
            "reinstall" => MachineCommand::Reinstall,
            "identify_led_on" => MachineCommand::IdentifyLedOn,
            "identify_led_off" => MachineCommand::IdentifyLedOff,
            "update_firmware" => {
                let firmware = message.firmware.ok_or(DecodeError::MissingFirmware)?;
                MachineCommand::UpdateFirmware {
                    kind: firmware.kind,
                    url: firmware.url,
                }
            }
            "machine_deleted" => MachineCommand::Deleted,
            "machine_created" => MachineCommand::Created,
            _ => MachineCommand::Unhandled(message.command),
        };

        Ok(Self {
            machine_id: message.machine_id,
            command,
            bmc: message.bmc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_power_command_with_bmc() {
        let payload = br#"{
            "machine_id": "m1",
            "command": "power_cycle",
            "bmc": {"address": "10.0.0.5:443", "user": "ADMIN", "password": "pw"}
        }"#;
        let envelope = CommandEnvelope::decode(payload).unwrap();
        assert_eq!(envelope.machine_id, "m1");
        assert_eq!(envelope.command, MachineCommand::PowerCycle);
        assert_eq!(envelope.bmc.unwrap().address, "10.0.0.5:443");
    }

    #[test]
    fn test_decode_update_firmware() {
        let payload = br#"{"machine_id":"m1","command":"update_firmware","firmware":{"kind":"bios","url":"http://fw/bios.bin"}}"#;
        let envelope = CommandEnvelope::decode(payload).unwrap();
        assert_eq!(
            envelope.command,
            MachineCommand::UpdateFirmware {
                kind: "bios".to_string(),
                url: "http://fw/bios.bin".to_string()
            }
        );
        assert!(envelope.bmc.is_none());
    }

    #[test]
    fn test_decode_update_firmware_without_details() {
        let payload = br#"{"machine_id":"m1","command":"update_firmware"}"#;
        assert!(matches!(
            CommandEnvelope::decode(payload),
            Err(DecodeError::MissingFirmware)
        ));
    }

    #[test]
    fn test_decode_unknown_command() {
        let payload = br#"{"machine_id":"m1","command":"self_destruct"}"#;
        let envelope = CommandEnvelope::decode(payload).unwrap();
        assert_eq!(
            envelope.command,
            MachineCommand::Unhandled("self_destruct".to_string())
        );
        assert_eq!(envelope.command.to_string(), "self_destruct");
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            CommandEnvelope::decode(b"not json"),
            Err(DecodeError::Json(_))
        ));
    }
}
