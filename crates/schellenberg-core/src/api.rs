//! Driver facade
//!
//! [`SchellenbergUsb`] is the one type a host platform needs: it owns the
//! link to the stick, the registry of paired motors, and the position
//! tracker, and exposes the operations a cover integration calls. All
//! methods take `&self`; the handle is cheap to clone and safe to share
//! across tasks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::pairing::{DeviceHandle, PairingFailure, PairingSession};
use crate::position::{CalibrationProfile, Direction, PositionTracker};
use crate::protocol::frame::encode_transmit;
use crate::protocol::link::{self, ExpectedReply, LinkHandle};
use crate::protocol::{
    BlindCommand, BootMode, ConnectionStatus, DeviceEnum, DeviceMode, Error, Frame, LinkEvent,
    Result, StickCommand, CALIBRATION_WINDOW, PAIRING_WINDOW,
};

/// Pause after entering listening mode; the stick drops input while its
/// radio spins up.
const LISTEN_SETTLE: Duration = Duration::from_millis(500);

/// Retry backoff starts here and doubles per attempt
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// One registered motor as persisted by the host platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Six-digit hex radio id
    pub id: String,
    /// Enumerator slot the motor was paired on
    pub device_enum: DeviceEnum,
    /// Calibration data, empty defaults for an uncalibrated motor
    #[serde(default)]
    pub profile: CalibrationProfile,
}

/// Sessions that must not overlap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exclusive {
    Idle,
    Pairing,
    Calibrating,
}

/// Resets the exclusive slot when a session ends, however it ends
struct SessionGuard {
    slot: Arc<Mutex<Exclusive>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *lock(&self.slot) = Exclusive::Idle;
    }
}

/// Handle to a Schellenberg USB stick and the motors paired to it
#[derive(Clone)]
pub struct SchellenbergUsb {
    link: Arc<Mutex<Option<LinkHandle>>>,
    hub_id: Arc<Mutex<Option<String>>>,
    firmware: Arc<Mutex<Option<String>>>,
    devices: Arc<Mutex<HashMap<String, DeviceEnum>>>,
    tracker: Arc<Mutex<PositionTracker>>,
    exclusive: Arc<Mutex<Exclusive>>,
    pairing_cancel: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl Default for SchellenbergUsb {
    fn default() -> Self {
        Self::new()
    }
}

impl SchellenbergUsb {
    /// Create a disconnected driver with an empty device registry
    pub fn new() -> Self {
        Self {
            link: Arc::new(Mutex::new(None)),
            hub_id: Arc::new(Mutex::new(None)),
            firmware: Arc::new(Mutex::new(None)),
            devices: Arc::new(Mutex::new(HashMap::new())),
            tracker: Arc::new(Mutex::new(PositionTracker::new())),
            exclusive: Arc::new(Mutex::new(Exclusive::Idle)),
            pairing_cancel: Arc::new(Mutex::new(None)),
        }
    }

    // ---- connection lifecycle ----

    /// Open `port` and run the connection handshake: verify the stick,
    /// switch it to listening mode, and read its radio id.
    pub async fn connect(&self, port: &str, baud_rate: Option<u32>) -> Result<()> {
        let stream = crate::protocol::serial::open_stream(port, baud_rate)?;
        self.connect_stream(stream).await
    }

    /// Like [`connect`](Self::connect), retrying with doubling backoff.
    pub async fn connect_with_retry(
        &self,
        port: &str,
        baud_rate: Option<u32>,
        attempts: u32,
    ) -> Result<()> {
        let mut backoff = RETRY_BACKOFF;
        let mut last = Error::NotConnected;
        for attempt in 1..=attempts.max(1) {
            match self.connect(port, baud_rate).await {
                Ok(()) => return Ok(()),
                Err(Error::AlreadyConnected) => return Err(Error::AlreadyConnected),
                Err(e) => {
                    warn!(attempt, error = %e, "connect attempt failed");
                    last = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(last)
    }

    /// Run the handshake over an already-open stream
    pub(crate) async fn connect_stream<S>(&self, stream: S) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        {
            let current = lock(&self.link);
            if current.as_ref().is_some_and(|l| l.is_connected()) {
                return Err(Error::AlreadyConnected);
            }
        }

        let link = link::spawn(stream);

        let frame = link
            .request(StickCommand::Verify.wire_str(), ExpectedReply::Verify)
            .await?;
        let Some(Frame::Verify { version, boot_mode }) = frame else {
            link.shutdown().await;
            return Err(Error::VerificationFailed("no verify response".into()));
        };
        if boot_mode == BootMode::Bootloader {
            link.shutdown().await;
            return Err(Error::VerificationFailed(
                "stick is in bootloader mode".into(),
            ));
        }
        info!(version, "stick verified");

        // Any lowercase command moves the stick from B:1 to listening.
        link.request("hello".into(), ExpectedReply::None).await?;
        tokio::time::sleep(LISTEN_SETTLE).await;
        link.set_mode(DeviceMode::Listening).await;

        let frame = link
            .request(StickCommand::DeviceId.wire_str(), ExpectedReply::StickId)
            .await?;
        let Some(Frame::StickId { id }) = frame else {
            link.shutdown().await;
            return Err(Error::VerificationFailed("no stick id response".into()));
        };
        info!(hub_id = %id, "connected");

        *lock(&self.hub_id) = Some(id);
        *lock(&self.firmware) = Some(version);
        *lock(&self.link) = Some(link.clone());

        tokio::spawn(pump_events(link.subscribe(), self.tracker.clone()));
        Ok(())
    }

    /// Shut the link down. The device registry and calibration data stay.
    pub async fn disconnect(&self) -> Result<()> {
        let link = lock(&self.link).take().ok_or(Error::NotConnected)?;
        link.shutdown().await;
        *lock(&self.hub_id) = None;
        *lock(&self.firmware) = None;
        Ok(())
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        match lock(&self.link).as_ref() {
            Some(link) => link.status().borrow().clone(),
            None => ConnectionStatus {
                is_connected: false,
                device_mode: DeviceMode::Initial,
                last_error: None,
            },
        }
    }

    /// Subscribe to decoded inbound frames
    pub fn subscribe(&self) -> Result<broadcast::Receiver<LinkEvent>> {
        Ok(self.link()?.subscribe())
    }

    /// Watch connection status changes for the current link
    pub fn watch_status(&self) -> Result<watch::Receiver<ConnectionStatus>> {
        Ok(self.link()?.status())
    }

    /// The stick's own six-digit radio id, once connected
    pub fn hub_id(&self) -> Option<String> {
        lock(&self.hub_id).clone()
    }

    /// Firmware version word reported at connect time
    pub fn firmware_version(&self) -> Option<String> {
        lock(&self.firmware).clone()
    }

    // ---- device registry ----

    /// Register a motor paired in an earlier session
    pub fn register_device(&self, device_id: &str, device_enum: DeviceEnum) {
        lock(&self.devices).insert(device_id.to_string(), device_enum);
        lock(&self.tracker).register(device_id);
    }

    /// Register a motor along with its stored calibration profile
    pub fn restore_device(
        &self,
        device_id: &str,
        device_enum: DeviceEnum,
        profile: CalibrationProfile,
    ) {
        lock(&self.devices).insert(device_id.to_string(), device_enum);
        lock(&self.tracker).restore(device_id, profile);
    }

    /// Drop a motor from the registry
    pub fn forget_device(&self, device_id: &str) {
        lock(&self.devices).remove(device_id);
        lock(&self.tracker).forget(device_id);
    }

    /// Registered motors and their enumerator slots
    pub fn devices(&self) -> Vec<(String, DeviceEnum)> {
        let mut v: Vec<_> = lock(&self.devices)
            .iter()
            .map(|(id, e)| (id.clone(), *e))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        v
    }

    /// Serialize the device registry and calibration data to JSON, for
    /// the host to persist across restarts.
    pub fn export_state(&self) -> Result<String> {
        let state: Vec<StoredDevice> = {
            let devices = lock(&self.devices);
            let tracker = lock(&self.tracker);
            let mut v: Vec<StoredDevice> = devices
                .iter()
                .map(|(id, device_enum)| StoredDevice {
                    id: id.clone(),
                    device_enum: *device_enum,
                    profile: tracker.profile(id).cloned().unwrap_or_default(),
                })
                .collect();
            v.sort_by(|a, b| a.id.cmp(&b.id));
            v
        };
        Ok(serde_json::to_string_pretty(&state)?)
    }

    /// Restore a registry previously produced by
    /// [`export_state`](Self::export_state).
    pub fn import_state(&self, json: &str) -> Result<()> {
        let state: Vec<StoredDevice> = serde_json::from_str(json)?;
        for device in state {
            self.restore_device(&device.id, device.device_enum, device.profile);
        }
        Ok(())
    }

    /// Calibration snapshot for a motor, for the host to persist
    pub fn profile(&self, device_id: &str) -> Result<CalibrationProfile> {
        lock(&self.tracker)
            .profile(device_id)
            .cloned()
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))
    }

    /// Estimated position of a motor, 1.0 open to 0.0 closed.
    /// `None` until the motor is calibrated.
    pub fn position(&self, device_id: &str) -> Result<Option<f64>> {
        let tracker = lock(&self.tracker);
        if !tracker.contains(device_id) {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }
        Ok(tracker.position_at(device_id, Instant::now()))
    }

    // ---- blind control ----

    /// Transmit a radio command to a registered motor.
    ///
    /// `Pair` is not a control command; use
    /// [`start_pairing`](Self::start_pairing).
    pub async fn control(&self, device_id: &str, cmd: BlindCommand) -> Result<()> {
        if cmd == BlindCommand::Pair {
            return Err(Error::InvalidArgument(
                "pairing runs through start_pairing".into(),
            ));
        }
        let device_enum = lock(&self.devices)
            .get(device_id)
            .copied()
            .ok_or_else(|| Error::UnknownDevice(device_id.to_string()))?;
        self.transmit(device_enum, cmd).await
    }

    /// Store the motor's current position as its upper endpoint
    pub async fn set_upper_endpoint(&self, device_id: &str) -> Result<()> {
        self.control(device_id, BlindCommand::SetUpperEndpoint).await
    }

    /// Store the motor's current position as its lower endpoint
    pub async fn set_lower_endpoint(&self, device_id: &str) -> Result<()> {
        self.control(device_id, BlindCommand::SetLowerEndpoint).await
    }

    /// Make the motor listen for an additional remote id
    pub async fn allow_pairing_on_device(&self, device_id: &str) -> Result<()> {
        self.control(device_id, BlindCommand::AllowPairing).await
    }

    /// Jog the motor upward as if the remote's up button were held
    pub async fn manual_up(&self, device_id: &str) -> Result<()> {
        self.control(device_id, BlindCommand::ManualUp).await
    }

    /// Jog the motor downward as if the remote's down button were held
    pub async fn manual_down(&self, device_id: &str) -> Result<()> {
        self.control(device_id, BlindCommand::ManualDown).await
    }

    async fn transmit(&self, device_enum: DeviceEnum, cmd: BlindCommand) -> Result<()> {
        let frame = self
            .link()?
            .request(encode_transmit(device_enum, cmd), ExpectedReply::TransmitAck)
            .await?;
        match frame {
            Some(Frame::TransmitAck { accepted: true }) => Ok(()),
            _ => Err(Error::TransmitRejected),
        }
    }

    // ---- stick-local commands ----

    /// Switch the stick's LED on or off
    pub async fn set_led(&self, on: bool) -> Result<()> {
        let cmd = if on {
            StickCommand::LedOn
        } else {
            StickCommand::LedOff
        };
        self.stick_command(cmd).await
    }

    /// Blink the stick's LED `times` times (1..=9)
    pub async fn blink_led(&self, times: u8) -> Result<()> {
        if !(1..=9).contains(&times) {
            return Err(Error::InvalidArgument(format!(
                "blink count {times} out of range 1..=9"
            )));
        }
        self.stick_command(StickCommand::LedBlink(times)).await
    }

    /// Enable the stick's local echo of received commands
    pub async fn echo_on(&self) -> Result<()> {
        self.stick_command(StickCommand::EchoOn).await
    }

    /// Disable the stick's local echo
    pub async fn echo_off(&self) -> Result<()> {
        self.stick_command(StickCommand::EchoOff).await
    }

    /// Switch the stick into bootloader mode (B:0) for firmware updates
    pub async fn enter_bootloader_mode(&self) -> Result<()> {
        let link = self.link()?;
        link.request(
            StickCommand::EnterBootloader.wire_str(),
            ExpectedReply::None,
        )
        .await?;
        link.set_mode(DeviceMode::Bootloader).await;
        Ok(())
    }

    /// Switch the stick back to initial mode (B:1)
    pub async fn enter_initial_mode(&self) -> Result<()> {
        let link = self.link()?;
        link.request(StickCommand::EnterInitial.wire_str(), ExpectedReply::None)
            .await?;
        link.set_mode(DeviceMode::Initial).await;
        Ok(())
    }

    /// Reboot the stick. Only honored while in bootloader mode.
    pub async fn reboot_stick(&self) -> Result<()> {
        self.stick_command(StickCommand::Reboot).await
    }

    async fn stick_command(&self, cmd: StickCommand) -> Result<()> {
        self.link()?
            .request(cmd.wire_str(), ExpectedReply::None)
            .await?;
        Ok(())
    }

    // ---- pairing ----

    /// Pair a new motor.
    ///
    /// Transmits the pair command on the next free enumerator slot, then
    /// waits up to the pairing window for a motor to announce itself. The
    /// joined motor is registered and returned. At most one pairing or
    /// calibration session runs at a time.
    pub async fn start_pairing(&self) -> Result<DeviceHandle> {
        let _guard = self.begin(Exclusive::Pairing)?;
        let link = self.link()?;

        let cancel = Arc::new(Notify::new());
        *lock(&self.pairing_cancel) = Some(cancel.clone());

        let result = self.run_pairing(&link, &cancel).await;

        *lock(&self.pairing_cancel) = None;
        // sp takes the stick out of pairing mode whatever happened.
        let _ = link
            .request(StickCommand::LeavePairing.wire_str(), ExpectedReply::None)
            .await;
        link.set_mode(DeviceMode::Listening).await;
        result
    }

    async fn run_pairing(&self, link: &LinkHandle, cancel: &Notify) -> Result<DeviceHandle> {
        let (device_enum, known_ids) = {
            let devices = lock(&self.devices);
            let known: HashSet<String> = devices.keys().cloned().collect();
            (DeviceEnum::next_free(&devices), known)
        };
        let mut session = PairingSession::new(device_enum, known_ids);

        // Subscribe before transmitting so the join cannot slip past us.
        let mut events = link.subscribe();
        link.set_mode(DeviceMode::Pairing).await;
        info!(%device_enum, "pairing started");

        match link
            .request(
                encode_transmit(device_enum, BlindCommand::Pair),
                ExpectedReply::TransmitAck,
            )
            .await
        {
            Ok(Some(Frame::TransmitAck { accepted: true })) => session.dongle_acknowledged(),
            Ok(_) => {
                session.fail(PairingFailure::NotAcknowledged);
                return Err(Error::TransmitRejected);
            }
            Err(e) => {
                session.fail(PairingFailure::NotAcknowledged);
                return Err(e);
            }
        }

        let deadline = Instant::now() + PAIRING_WINDOW;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(LinkEvent::Frame(frame)) => {
                        if let Some(handle) = session.observe(&frame) {
                            info!(device_id = %handle.id, %device_enum, "motor paired");
                            self.register_device(&handle.id, handle.device_enum);
                            return Ok(handle);
                        }
                    }
                    Ok(LinkEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        session.fail(PairingFailure::Cancelled);
                        return Err(Error::ConnectionLost);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "pairing subscriber lagged");
                    }
                },
                _ = cancel.notified() => {
                    session.fail(PairingFailure::Cancelled);
                    info!("pairing cancelled");
                    return Err(Error::PairingCancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    session.fail(PairingFailure::WindowElapsed);
                    info!("pairing window elapsed");
                    return Err(Error::PairingTimeout);
                }
            }
        }
    }

    /// Cancel the active pairing session
    pub fn cancel_pairing(&self) -> Result<()> {
        match lock(&self.pairing_cancel).as_ref() {
            Some(cancel) => {
                cancel.notify_one();
                Ok(())
            }
            None => Err(Error::InvalidArgument("no pairing session active".into())),
        }
    }

    // ---- calibration ----

    /// Measure a motor's full travel time in one direction.
    ///
    /// Arms a listener, then waits for the caller to drive the motor
    /// across its full travel (via [`control`](Self::control) or the
    /// physical remote). The elapsed time between the motion-start and
    /// motion-stop events becomes the calibrated duration, and the motor's
    /// position is pinned to the endpoint the run finished at.
    pub async fn calibrate(&self, device_id: &str, direction: Direction) -> Result<Duration> {
        let _guard = self.begin(Exclusive::Calibrating)?;
        if !lock(&self.devices).contains_key(device_id) {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }
        let link = self.link()?;

        let mut events = link.subscribe();
        link.set_mode(DeviceMode::Calibrating).await;
        info!(device_id, ?direction, "calibration armed");

        let result = run_calibration(&mut events, device_id, direction).await;
        link.set_mode(DeviceMode::Listening).await;

        let duration = result?;
        lock(&self.tracker).set_duration(device_id, direction, duration);
        info!(device_id, ?direction, ?duration, "calibration complete");
        Ok(duration)
    }

    // ---- internals ----

    fn link(&self) -> Result<LinkHandle> {
        lock(&self.link).clone().ok_or(Error::NotConnected)
    }

    fn begin(&self, want: Exclusive) -> Result<SessionGuard> {
        let mut slot = lock(&self.exclusive);
        match *slot {
            Exclusive::Idle => {
                *slot = want;
                Ok(SessionGuard {
                    slot: self.exclusive.clone(),
                })
            }
            Exclusive::Pairing if want == Exclusive::Pairing => Err(Error::PairingInProgress),
            Exclusive::Pairing => Err(Error::ModeConflict("pairing")),
            Exclusive::Calibrating => Err(Error::ModeConflict("calibration")),
        }
    }
}

async fn run_calibration(
    events: &mut broadcast::Receiver<LinkEvent>,
    device_id: &str,
    direction: Direction,
) -> Result<Duration> {
    let mut run = crate::position::PhaseRun::new(direction);
    let mut deadline = Instant::now() + CALIBRATION_WINDOW;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LinkEvent::Frame(frame)) => {
                    let Frame::DeviceEvent { device_id: from, .. } = &frame else {
                        continue;
                    };
                    if from != device_id {
                        continue;
                    }
                    let Some(motion) = frame.motion() else { continue };
                    if let Some(duration) = run.on_motion(motion, Instant::now()) {
                        return Ok(duration);
                    }
                    // The window bounds the wait for each motion edge, not
                    // the whole run; a slow full travel must not time out.
                    if matches!(run, crate::position::PhaseRun::Timing { .. }) {
                        deadline = Instant::now() + CALIBRATION_WINDOW;
                    }
                }
                Ok(LinkEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::ConnectionLost);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "calibration subscriber lagged");
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::CalibrationTimeout);
            }
        }
    }
}

/// Feeds radio motion events into the position tracker until the link
/// closes.
async fn pump_events(
    mut events: broadcast::Receiver<LinkEvent>,
    tracker: Arc<Mutex<PositionTracker>>,
) {
    loop {
        match events.recv().await {
            Ok(LinkEvent::Frame(frame)) => {
                let Frame::DeviceEvent { device_id, .. } = &frame else {
                    continue;
                };
                if let Some(motion) = frame.motion() {
                    lock(&tracker).on_motion(device_id, motion, Instant::now());
                }
            }
            Ok(LinkEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "event pump lagged");
            }
        }
    }
}

/// Lock helper that survives a poisoned mutex; the guarded state stays
/// consistent because no holder panics mid-update.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
