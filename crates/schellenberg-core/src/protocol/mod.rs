//! Wire protocol for the Schellenberg USB stick
//!
//! Split into layers: [`serial`] opens the port, [`frame`] encodes and
//! decodes lines, [`commands`] defines the command set, and [`link`] runs
//! the actor that owns the stream and correlates replies.

pub mod commands;
pub mod error;
pub mod frame;
pub mod link;
pub mod serial;

pub use commands::{BlindCommand, DeviceEnum, StickCommand, DEVICE_ENUM_START};
pub use error::{Error, Result};
pub use frame::{BootMode, Frame, MotionEvent};
pub use link::{ConnectionStatus, DeviceMode, LinkEvent, LinkHandle};
pub use serial::{list_ports, PortInfo};

use std::time::Duration;

/// Baud rate the stick firmware runs its UART at
pub const DEFAULT_BAUD_RATE: u32 = 112_500;

/// Longest inbound line accepted before the codec discards it
pub const MAX_LINE_LEN: usize = 256;

/// How long to wait for the `RFTU_` verify response
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for a transmit acknowledgement
pub const TRANSMIT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for a stick-local query reply such as `sr`
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a pairing session waits for a motor to join
pub const PAIRING_WINDOW: Duration = Duration::from_secs(120);

/// How long a calibration phase waits for the measured motion
pub const CALIBRATION_WINDOW: Duration = Duration::from_secs(300);
