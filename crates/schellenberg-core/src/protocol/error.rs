//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the USB stick
#[derive(Error, Debug)]
pub enum Error {
    /// Serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored driver state could not be read or written
    #[error("State serialization failed: {0}")]
    State(#[from] serde_json::Error),

    /// Operation requires an open connection
    #[error("Not connected to USB stick")]
    NotConnected,

    /// A connection is already open
    #[error("Already connected")]
    AlreadyConnected,

    /// The serial link went down mid-operation
    #[error("Connection lost")]
    ConnectionLost,

    /// The device on the port is not a Schellenberg stick, or is in the
    /// wrong mode
    #[error("Device verification failed: {0}")]
    VerificationFailed(String),

    /// An inbound line could not be decoded
    #[error("Malformed frame: {0:?}")]
    MalformedFrame(String),

    /// The stick did not reply in time
    #[error("No response within the command timeout")]
    CommandTimeout,

    /// The stick's transmitter was busy; the command was not sent
    #[error("Transmitter busy (tE)")]
    StickBusy,

    /// The stick refused to transmit the command
    #[error("Stick rejected the transmission (t0)")]
    TransmitRejected,

    /// Only one pairing session may run at a time
    #[error("A pairing session is already in progress")]
    PairingInProgress,

    /// The pairing window elapsed without a motor joining
    #[error("No device joined within the pairing window")]
    PairingTimeout,

    /// The caller cancelled the pairing session
    #[error("Pairing cancelled")]
    PairingCancelled,

    /// The calibration window elapsed without the measured motion
    #[error("No motion observed within the calibration window")]
    CalibrationTimeout,

    /// The operation cannot run alongside the named session
    #[error("Operation conflicts with the active {0} session")]
    ModeConflict(&'static str),

    /// The motor id is not in the device registry
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// A parameter was out of range or otherwise unusable
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
