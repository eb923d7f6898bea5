//! Pairing session state machine
//!
//! Pairing a motor is a three-step exchange: the driver transmits the pair
//! command on a freshly allocated enumerator slot, the stick acknowledges
//! the transmission, and then at some point during the pairing window the
//! motor announces itself over the radio. The session tracks where in that
//! exchange we are; the timers and wire traffic live in [`crate::api`].
//!
//! A motor joining shows up either as an `sl` pairing notice or as plain
//! radio traffic from an id we have never seen. Traffic from already
//! registered motors is normal operation and never completes a session.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::protocol::{DeviceEnum, Frame};

/// A successfully paired motor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Six-digit hex radio id the motor announced
    pub id: String,
    /// Enumerator slot the motor was paired on
    pub device_enum: DeviceEnum,
}

/// Why a session ended without a paired motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailure {
    /// The stick never acknowledged the pair transmission
    NotAcknowledged,
    /// No motor announced itself within the pairing window
    WindowElapsed,
    /// The caller cancelled the session
    Cancelled,
}

/// Session progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    /// Pair command written, waiting for the stick's transmit ack
    AwaitingDongleAck,
    /// Ack received, waiting for a motor to announce itself
    AwaitingDeviceJoin,
    /// A motor joined
    Paired(DeviceHandle),
    /// The session ended without a motor
    Failed(PairingFailure),
}

/// One pairing attempt on a single enumerator slot
#[derive(Debug)]
pub struct PairingSession {
    device_enum: DeviceEnum,
    known_ids: HashSet<String>,
    state: PairingState,
}

impl PairingSession {
    /// Start a session for `device_enum`. `known_ids` are the radio ids of
    /// motors already registered; their traffic is ignored.
    pub fn new(device_enum: DeviceEnum, known_ids: HashSet<String>) -> Self {
        Self {
            device_enum,
            known_ids,
            state: PairingState::AwaitingDongleAck,
        }
    }

    /// Current progress
    pub fn state(&self) -> &PairingState {
        &self.state
    }

    /// Slot this session will hand to the joining motor
    pub fn device_enum(&self) -> DeviceEnum {
        self.device_enum
    }

    /// The stick acknowledged the pair transmission
    pub fn dongle_acknowledged(&mut self) {
        if self.state == PairingState::AwaitingDongleAck {
            self.state = PairingState::AwaitingDeviceJoin;
        }
    }

    /// Feed an inbound frame. Returns the handle when this frame completed
    /// the session.
    pub fn observe(&mut self, frame: &Frame) -> Option<DeviceHandle> {
        if self.state != PairingState::AwaitingDeviceJoin {
            return None;
        }
        let candidate = match frame {
            Frame::PairingNotice { device_id } => Some(device_id),
            Frame::DeviceEvent { device_id, .. } if !self.known_ids.contains(device_id) => {
                Some(device_id)
            }
            _ => None,
        }?;
        let handle = DeviceHandle {
            id: candidate.clone(),
            device_enum: self.device_enum,
        };
        self.state = PairingState::Paired(handle.clone());
        Some(handle)
    }

    /// End the session without a motor
    pub fn fail(&mut self, reason: PairingFailure) {
        if !matches!(self.state, PairingState::Paired(_)) {
            self.state = PairingState::Failed(reason);
        }
    }

    /// Whether the session is still waiting on the stick or a motor
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            PairingState::AwaitingDongleAck | PairingState::AwaitingDeviceJoin
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use pretty_assertions::assert_eq;

    fn known(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pairing_via_notice() {
        let mut session = PairingSession::new(DeviceEnum(0x11), known(&["5D3E7C"]));
        assert_eq!(*session.state(), PairingState::AwaitingDongleAck);

        session.dongle_acknowledged();
        assert_eq!(*session.state(), PairingState::AwaitingDeviceJoin);

        let handle = session
            .observe(&Frame::parse("sl00BEA1B2C3FF01"))
            .expect("joined");
        assert_eq!(
            handle,
            DeviceHandle {
                id: "A1B2C3".to_string(),
                device_enum: DeviceEnum(0x11),
            }
        );
        assert_eq!(*session.state(), PairingState::Paired(handle));
    }

    #[test]
    fn test_pairing_via_unknown_device_traffic() {
        let mut session = PairingSession::new(DeviceEnum(0x11), known(&["5D3E7C"]));
        session.dongle_acknowledged();

        let handle = session
            .observe(&Frame::parse("ss11A1B2C3000160002F"))
            .expect("joined");
        assert_eq!(handle.id, "A1B2C3");
    }

    #[test]
    fn test_registered_device_traffic_is_ignored() {
        let mut session = PairingSession::new(DeviceEnum(0x11), known(&["5D3E7C"]));
        session.dongle_acknowledged();

        assert!(session
            .observe(&Frame::parse("ss105D3E7C000101002F"))
            .is_none());
        assert!(session.is_active());
    }

    #[test]
    fn test_frames_before_ack_do_not_join() {
        let mut session = PairingSession::new(DeviceEnum(0x11), known(&[]));
        assert!(session.observe(&Frame::parse("sl00BEA1B2C3FF01")).is_none());
        assert_eq!(*session.state(), PairingState::AwaitingDongleAck);
    }

    #[test]
    fn test_failure_reasons() {
        let mut session = PairingSession::new(DeviceEnum(0x11), known(&[]));
        session.fail(PairingFailure::NotAcknowledged);
        assert_eq!(
            *session.state(),
            PairingState::Failed(PairingFailure::NotAcknowledged)
        );
        assert!(!session.is_active());

        let mut session = PairingSession::new(DeviceEnum(0x11), known(&[]));
        session.dongle_acknowledged();
        session.fail(PairingFailure::WindowElapsed);
        assert_eq!(
            *session.state(),
            PairingState::Failed(PairingFailure::WindowElapsed)
        );
    }

    #[test]
    fn test_paired_session_cannot_fail() {
        let mut session = PairingSession::new(DeviceEnum(0x11), known(&[]));
        session.dongle_acknowledged();
        session
            .observe(&Frame::parse("sl00BEA1B2C3FF01"))
            .expect("joined");

        session.fail(PairingFailure::Cancelled);
        assert!(matches!(*session.state(), PairingState::Paired(_)));
    }
}
