//! Protocol commands
//!
//! Defines the command set of the Schellenberg USB stick: radio commands
//! transmitted to paired motors and local commands handled by the stick
//! itself.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// First device enumerator handed out when pairing new motors
pub const DEVICE_ENUM_START: u8 = 0x10;

/// Radio commands transmitted to a blind motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlindCommand {
    /// Stop movement (code `00`)
    Stop,

    /// Move up / open (code `01`)
    Up,

    /// Move down / close (code `02`)
    Down,

    /// Make the motor listen for a new remote id (code `40`)
    AllowPairing,

    /// Move up while "held" (code `41`)
    ManualUp,

    /// Move down while "held" (code `42`)
    ManualDown,

    /// Pair with the motor / change rotation direction (code `60`)
    Pair,

    /// Store the current position as the upper endpoint (code `61`)
    SetUpperEndpoint,

    /// Store the current position as the lower endpoint (code `62`)
    SetLowerEndpoint,
}

impl BlindCommand {
    /// Two-digit hex command code as it appears on the wire
    pub fn code(&self) -> &'static str {
        match self {
            BlindCommand::Stop => "00",
            BlindCommand::Up => "01",
            BlindCommand::Down => "02",
            BlindCommand::AllowPairing => "40",
            BlindCommand::ManualUp => "41",
            BlindCommand::ManualDown => "42",
            BlindCommand::Pair => "60",
            BlindCommand::SetUpperEndpoint => "61",
            BlindCommand::SetLowerEndpoint => "62",
        }
    }

    /// Parse a two-digit wire code back into a command
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "00" => BlindCommand::Stop,
            "01" => BlindCommand::Up,
            "02" => BlindCommand::Down,
            "40" => BlindCommand::AllowPairing,
            "41" => BlindCommand::ManualUp,
            "42" => BlindCommand::ManualDown,
            "60" => BlindCommand::Pair,
            "61" => BlindCommand::SetUpperEndpoint,
            "62" => BlindCommand::SetLowerEndpoint,
            _ => return None,
        })
    }
}

/// Local commands handled by the USB stick itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickCommand {
    /// Query version and boot mode (`!?`)
    Verify,

    /// Enter bootloader mode B:0 (`!B`)
    EnterBootloader,

    /// Enter initial mode B:1 (`!G`)
    EnterInitial,

    /// Reboot the stick, bootloader mode only (`!R`)
    Reboot,

    /// Enable local echo (`!E1`)
    EchoOn,

    /// Disable local echo (`!E0`)
    EchoOff,

    /// Query the stick's own radio id (`sr`)
    DeviceId,

    /// LED on (`so+`)
    LedOn,

    /// LED off (`so-`)
    LedOff,

    /// Blink the LED 1-9 times (`so1`..`so9`)
    LedBlink(u8),

    /// Parameter query; also takes the stick out of pairing mode (`sp`)
    LeavePairing,
}

impl StickCommand {
    /// The exact line sent to the stick (terminator excluded)
    pub fn wire_str(&self) -> String {
        match self {
            StickCommand::Verify => "!?".to_string(),
            StickCommand::EnterBootloader => "!B".to_string(),
            StickCommand::EnterInitial => "!G".to_string(),
            StickCommand::Reboot => "!R".to_string(),
            StickCommand::EchoOn => "!E1".to_string(),
            StickCommand::EchoOff => "!E0".to_string(),
            StickCommand::DeviceId => "sr".to_string(),
            StickCommand::LedOn => "so+".to_string(),
            StickCommand::LedOff => "so-".to_string(),
            StickCommand::LedBlink(n) => format!("so{n}"),
            StickCommand::LeavePairing => "sp".to_string(),
        }
    }
}

/// Two-hex-digit device enumerator assigned to a motor at pairing time.
///
/// The stick addresses paired motors by this slot number, not by their
/// six-digit radio id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceEnum(pub u8);

impl DeviceEnum {
    /// Compute the next free enumerator given the enums already in use.
    ///
    /// Starts at `DEVICE_ENUM_START` and wraps back to it past 0xFF, the
    /// same allocation the stick firmware expects.
    pub fn next_free(registered: &HashMap<String, DeviceEnum>) -> DeviceEnum {
        let max = registered
            .values()
            .map(|e| e.0)
            .max()
            .unwrap_or(DEVICE_ENUM_START - 1);
        match max.checked_add(1) {
            Some(next) if next >= DEVICE_ENUM_START => DeviceEnum(next),
            _ => DeviceEnum(DEVICE_ENUM_START),
        }
    }

    /// Parse a two-digit hex enumerator from the wire
    pub fn parse(s: &str) -> Option<DeviceEnum> {
        if s.len() != 2 {
            return None;
        }
        u8::from_str_radix(s, 16).ok().map(DeviceEnum)
    }
}

impl fmt::Display for DeviceEnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_blind_command_codes() {
        assert_eq!(BlindCommand::Stop.code(), "00");
        assert_eq!(BlindCommand::Up.code(), "01");
        assert_eq!(BlindCommand::Down.code(), "02");
        assert_eq!(BlindCommand::Pair.code(), "60");
        assert_eq!(BlindCommand::SetLowerEndpoint.code(), "62");
    }

    #[test]
    fn test_blind_command_code_roundtrip() {
        for cmd in [
            BlindCommand::Stop,
            BlindCommand::Up,
            BlindCommand::Down,
            BlindCommand::AllowPairing,
            BlindCommand::ManualUp,
            BlindCommand::ManualDown,
            BlindCommand::Pair,
            BlindCommand::SetUpperEndpoint,
            BlindCommand::SetLowerEndpoint,
        ] {
            assert_eq!(BlindCommand::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(BlindCommand::from_code("99"), None);
    }

    #[test]
    fn test_stick_command_wire_strings() {
        assert_eq!(StickCommand::Verify.wire_str(), "!?");
        assert_eq!(StickCommand::DeviceId.wire_str(), "sr");
        assert_eq!(StickCommand::LedOn.wire_str(), "so+");
        assert_eq!(StickCommand::LedOff.wire_str(), "so-");
        assert_eq!(StickCommand::LedBlink(5).wire_str(), "so5");
        assert_eq!(StickCommand::LeavePairing.wire_str(), "sp");
    }

    #[test]
    fn test_device_enum_allocation() {
        let mut registered = HashMap::new();
        assert_eq!(DeviceEnum::next_free(&registered), DeviceEnum(0x10));

        registered.insert("5D3E7C".to_string(), DeviceEnum(0x10));
        registered.insert("A1B2C3".to_string(), DeviceEnum(0x12));
        assert_eq!(DeviceEnum::next_free(&registered), DeviceEnum(0x13));
    }

    #[test]
    fn test_device_enum_wraps_after_ff() {
        let mut registered = HashMap::new();
        registered.insert("FFFFFF".to_string(), DeviceEnum(0xFF));
        assert_eq!(DeviceEnum::next_free(&registered), DeviceEnum(0x10));
    }

    #[test]
    fn test_device_enum_display_and_parse() {
        assert_eq!(DeviceEnum(0x10).to_string(), "10");
        assert_eq!(DeviceEnum(0xAB).to_string(), "AB");
        assert_eq!(DeviceEnum::parse("ab"), Some(DeviceEnum(0xAB)));
        assert_eq!(DeviceEnum::parse("zz"), None);
        assert_eq!(DeviceEnum::parse("1"), None);
    }
}
