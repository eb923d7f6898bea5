//! # Schellenberg USB Core Library
//!
//! Driver for the Schellenberg USB RF stick, bridging a host platform to
//! wireless roller-blind motors.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The stick's line-based ASCII serial protocol (framing, commands,
//!   reply correlation)
//! - Pairing of new motors onto enumerator slots
//! - Travel-time calibration and interpolated position tracking
//! - A single async facade, [`SchellenbergUsb`], for host integrations
//!
//! ## Example
//!
//! ```rust,ignore
//! use schellenberg_core::{BlindCommand, SchellenbergUsb};
//!
//! // Connect and verify the stick
//! let usb = SchellenbergUsb::new();
//! usb.connect("/dev/ttyACM0", None).await?;
//!
//! // Pair a motor, then drive it
//! let handle = usb.start_pairing().await?;
//! usb.control(&handle.id, BlindCommand::Down).await?;
//! ```

pub mod api;
pub mod pairing;
pub mod position;
pub mod protocol;

pub use api::{SchellenbergUsb, StoredDevice};
pub use pairing::{DeviceHandle, PairingFailure, PairingSession, PairingState};
pub use position::{CalibrationProfile, Direction, PhaseRun, PositionTracker};
pub use protocol::{
    BlindCommand, BootMode, ConnectionStatus, DeviceEnum, DeviceMode, Error, Frame, LinkEvent,
    MotionEvent, Result, StickCommand,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::SchellenbergUsb;
    pub use crate::pairing::{DeviceHandle, PairingState};
    pub use crate::position::{CalibrationProfile, Direction};
    pub use crate::protocol::{
        list_ports, BlindCommand, ConnectionStatus, DeviceEnum, DeviceMode, Error, Frame,
        LinkEvent, MotionEvent, PortInfo, Result,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
