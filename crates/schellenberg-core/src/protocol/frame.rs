//! Frame encoding/decoding
//!
//! The stick speaks a line-based ASCII protocol. Outbound commands are
//! short lines such as `ss109010000`; inbound lines are classified purely
//! by prefix and shape:
//!
//! - `RFTU_...`      verify response (version word plus `B:` boot mode)
//! - `t1` / `t0`     transmit acknowledgement
//! - `tE`            transmitter busy
//! - `sr<id:6>`      the stick's own radio id
//! - `sl....<id:6>`  pairing/list broadcast, device id at chars 6..12
//! - `ss<enum:2><id:6><ctr:4><code:2><pad:2><rssi:2>`  device event
//!
//! Decoding is total: anything that does not match a known shape becomes
//! [`Frame::Unknown`] so a single garbled line never tears down a session.

use serde::{Deserialize, Serialize};

use super::commands::{BlindCommand, DeviceEnum};

/// Boot mode reported in the `B:` field of the verify response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootMode {
    /// B:0, firmware update mode
    Bootloader,
    /// B:1, powered up but not yet listening
    Initial,
    /// Unrecognized `B:` value
    Other,
}

/// Motion state change reported by a motor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionEvent {
    /// Started moving up / opening (code `01`)
    StartedUp,
    /// Started moving down / closing (code `02`)
    StartedDown,
    /// Stopped (code `00`)
    Stopped,
}

impl MotionEvent {
    /// Parse the two-digit event code carried in a device event
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "00" => MotionEvent::Stopped,
            "01" => MotionEvent::StartedUp,
            "02" => MotionEvent::StartedDown,
            _ => return None,
        })
    }
}

/// A decoded inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Verify response, e.g. `RFTU_V20 F:20180510_DFBD B:1`
    Verify {
        /// Version word, e.g. `RFTU_V20`
        version: String,
        /// Reported boot mode
        boot_mode: BootMode,
    },

    /// Transmit acknowledgement (`t1` accepted, `t0` rejected)
    TransmitAck {
        /// Whether the stick accepted the transmission
        accepted: bool,
    },

    /// Transmitter busy (`tE`); the command was not sent over the air
    TransmitBusy,

    /// The stick's own radio id, e.g. `sr5D3E7C`
    StickId {
        /// Six-digit hex id
        id: String,
    },

    /// Pairing/list broadcast carrying a motor's radio id
    PairingNotice {
        /// Six-digit hex id of the announcing motor
        device_id: String,
    },

    /// Radio traffic from a motor
    DeviceEvent {
        /// Enumerator slot the message was received on
        device_enum: DeviceEnum,
        /// Six-digit hex radio id of the motor
        device_id: String,
        /// Two-digit event/command code
        code: String,
    },

    /// Anything that matched no known pattern; kept for diagnostics
    Unknown {
        /// The raw line as received
        line: String,
    },
}

impl Frame {
    /// Decode one trimmed inbound line. Total: never fails.
    pub fn parse(line: &str) -> Frame {
        if let Some(frame) = parse_known(line) {
            frame
        } else {
            Frame::Unknown {
                line: line.to_string(),
            }
        }
    }

    /// Motion event carried by a device event frame, if any
    pub fn motion(&self) -> Option<MotionEvent> {
        match self {
            Frame::DeviceEvent { code, .. } => MotionEvent::from_code(code),
            _ => None,
        }
    }
}

fn parse_known(line: &str) -> Option<Frame> {
    // The protocol is pure ASCII; refusing anything else keeps the byte
    // slicing below safe.
    if !line.is_ascii() {
        return None;
    }

    if line.starts_with("RFTU_") {
        return Some(parse_verify(line));
    }

    match line {
        "t1" => return Some(Frame::TransmitAck { accepted: true }),
        "t0" => return Some(Frame::TransmitAck { accepted: false }),
        "tE" => return Some(Frame::TransmitBusy),
        _ => {}
    }

    if let Some(rest) = line.strip_prefix("sr") {
        if rest.len() >= 6 && is_hex(&rest[..6]) {
            return Some(Frame::StickId {
                id: rest[..6].to_string(),
            });
        }
        return None;
    }

    // sl<prefix:4><id:6>...: the four chars after "sl" are an address
    // prefix the stick prepends; the motor id follows.
    if line.starts_with("sl") && line.len() >= 12 && is_hex(&line[6..12]) {
        return Some(Frame::PairingNotice {
            device_id: line[6..12].to_string(),
        });
    }

    if line.starts_with("ss") && line.len() >= 18 {
        let device_enum = DeviceEnum::parse(&line[2..4])?;
        let device_id = &line[4..10];
        let code = &line[14..16];
        if !is_hex(device_id) || !is_hex(code) {
            return None;
        }
        return Some(Frame::DeviceEvent {
            device_enum,
            device_id: device_id.to_string(),
            code: code.to_string(),
        });
    }

    None
}

fn parse_verify(line: &str) -> Frame {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or("RFTU_").to_string();
    let boot_mode = parts
        .find_map(|p| p.strip_prefix("B:"))
        .map(|mode| match mode {
            "0" => BootMode::Bootloader,
            "1" => BootMode::Initial,
            _ => BootMode::Other,
        })
        .unwrap_or(BootMode::Initial);
    Frame::Verify { version, boot_mode }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Encode a radio command into the exact line sent to the stick.
///
/// Control, endpoint and manual commands use the repeated-transmit form
/// `ss<enum>9<code>0000`; the pairing initiation has no repeat digit and a
/// five-zero pad (`ss<enum>6000000`), matching the stick firmware.
pub fn encode_transmit(device_enum: DeviceEnum, cmd: BlindCommand) -> String {
    match cmd {
        BlindCommand::Pair => format!("ss{device_enum}{}00000", cmd.code()),
        _ => format!("ss{device_enum}9{}0000", cmd.code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_control_commands() {
        assert_eq!(
            encode_transmit(DeviceEnum(0x10), BlindCommand::Up),
            "ss109010000"
        );
        assert_eq!(
            encode_transmit(DeviceEnum(0x10), BlindCommand::Stop),
            "ss109000000"
        );
        assert_eq!(
            encode_transmit(DeviceEnum(0xAB), BlindCommand::SetUpperEndpoint),
            "ssAB9610000"
        );
    }

    #[test]
    fn test_encode_pairing_command_has_no_repeat_digit() {
        assert_eq!(
            encode_transmit(DeviceEnum(0x10), BlindCommand::Pair),
            "ss106000000"
        );
    }

    #[test]
    fn test_parse_verify_response() {
        let frame = Frame::parse("RFTU_V20 F:20180510_DFBD B:1");
        assert_eq!(
            frame,
            Frame::Verify {
                version: "RFTU_V20".to_string(),
                boot_mode: BootMode::Initial,
            }
        );

        let frame = Frame::parse("RFTU_V20 F:20180510_DFBD B:0");
        assert!(matches!(
            frame,
            Frame::Verify {
                boot_mode: BootMode::Bootloader,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_transmit_acks() {
        assert_eq!(Frame::parse("t1"), Frame::TransmitAck { accepted: true });
        assert_eq!(Frame::parse("t0"), Frame::TransmitAck { accepted: false });
        assert_eq!(Frame::parse("tE"), Frame::TransmitBusy);
    }

    #[test]
    fn test_parse_stick_id() {
        assert_eq!(
            Frame::parse("sr5D3E7C"),
            Frame::StickId {
                id: "5D3E7C".to_string()
            }
        );
        // Too short or non-hex degrades to Unknown
        assert!(matches!(Frame::parse("sr5D3"), Frame::Unknown { .. }));
        assert!(matches!(Frame::parse("srZZZZZZ"), Frame::Unknown { .. }));
    }

    #[test]
    fn test_parse_pairing_notice() {
        assert_eq!(
            Frame::parse("sl00BE5D3E7CFF01"),
            Frame::PairingNotice {
                device_id: "5D3E7C".to_string()
            }
        );
        assert!(matches!(Frame::parse("sl00BE5D"), Frame::Unknown { .. }));
    }

    #[test]
    fn test_parse_device_event() {
        // ss + enum 10 + id 5D3E7C + ctr 0001 + code 01 + pad 00 + rssi 2F
        let frame = Frame::parse("ss105D3E7C000101002F");
        assert_eq!(
            frame,
            Frame::DeviceEvent {
                device_enum: DeviceEnum(0x10),
                device_id: "5D3E7C".to_string(),
                code: "01".to_string(),
            }
        );
        assert_eq!(frame.motion(), Some(MotionEvent::StartedUp));

        let stopped = Frame::parse("ss105D3E7C000200002F");
        assert_eq!(stopped.motion(), Some(MotionEvent::Stopped));
    }

    #[test]
    fn test_device_event_roundtrips_through_transmit_grammar() {
        // A control command we transmit has the same prefix grammar the
        // motor echoes back in its event frames.
        let line = encode_transmit(DeviceEnum(0x10), BlindCommand::Down);
        assert!(line.starts_with("ss10"));
        assert_eq!(&line[5..7], BlindCommand::Down.code());
    }

    #[test]
    fn test_parse_is_total_on_garbage() {
        for line in [
            "",
            "x",
            "ss",
            "ssZZ",
            "ss10XYZQRS000101002F",
            "hello world",
            "t2",
            "!?",
            "\u{1F600}",
            "ss105D3E7C0001",
        ] {
            // Must classify, never panic
            let frame = Frame::parse(line);
            match frame {
                Frame::Unknown { .. } => {}
                other => panic!("expected Unknown for {line:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_motion_event_codes() {
        assert_eq!(MotionEvent::from_code("00"), Some(MotionEvent::Stopped));
        assert_eq!(MotionEvent::from_code("01"), Some(MotionEvent::StartedUp));
        assert_eq!(MotionEvent::from_code("02"), Some(MotionEvent::StartedDown));
        assert_eq!(MotionEvent::from_code("61"), None);
    }
}
