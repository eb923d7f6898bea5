//! Position estimation and travel-time calibration
//!
//! The motors report only motion edges (started up, started down, stopped),
//! never an absolute position. Position is therefore estimated: once the
//! full open and close travel times are calibrated, the tracker
//! interpolates linearly from the position at motion start and clamps to
//! the endpoints. 1.0 is fully open, 0.0 fully closed.
//!
//! Calibration itself is a measurement: arm a [`PhaseRun`] for one travel
//! direction, command the motor across its full travel, and the elapsed
//! time between the motion-start and motion-stop events becomes that
//! direction's duration.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::MotionEvent;

/// Travel direction of a calibrated run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Toward fully open (position 1.0)
    Up,
    /// Toward fully closed (position 0.0)
    Down,
}

impl Direction {
    fn from_motion(event: MotionEvent) -> Option<Direction> {
        match event {
            MotionEvent::StartedUp => Some(Direction::Up),
            MotionEvent::StartedDown => Some(Direction::Down),
            MotionEvent::Stopped => None,
        }
    }
}

/// Persistent calibration state for one motor.
///
/// Serializable so the host platform can store it across restarts and hand
/// it back through [`PositionTracker::restore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CalibrationProfile {
    /// Measured full travel time upward, if calibrated
    pub open_duration: Option<Duration>,
    /// Measured full travel time downward, if calibrated
    pub close_duration: Option<Duration>,
    /// Last known position in [0.0, 1.0], if known
    pub position: Option<f64>,
    /// Direction of the most recent movement
    pub last_direction: Option<Direction>,
    /// Wall-clock time of the last state change
    pub last_update: Option<DateTime<Utc>>,
}

struct ActiveMotion {
    direction: Direction,
    started_at: Instant,
    from: Option<f64>,
}

struct TrackedDevice {
    profile: CalibrationProfile,
    motion: Option<ActiveMotion>,
}

/// Per-motor position estimator
#[derive(Default)]
pub struct PositionTracker {
    devices: HashMap<String, TrackedDevice>,
}

impl PositionTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a motor with no calibration data
    pub fn register(&mut self, device_id: &str) {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| TrackedDevice {
                profile: CalibrationProfile::default(),
                motion: None,
            });
    }

    /// Start tracking a motor with a previously stored profile
    pub fn restore(&mut self, device_id: &str, profile: CalibrationProfile) {
        self.devices.insert(
            device_id.to_string(),
            TrackedDevice {
                profile,
                motion: None,
            },
        );
    }

    /// Stop tracking a motor
    pub fn forget(&mut self, device_id: &str) {
        self.devices.remove(device_id);
    }

    /// Whether the motor is tracked
    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// Snapshot of a motor's calibration state
    pub fn profile(&self, device_id: &str) -> Option<&CalibrationProfile> {
        self.devices.get(device_id).map(|d| &d.profile)
    }

    /// Apply a motion event observed on the radio.
    ///
    /// Events from motors that were never registered are dropped; a
    /// neighbor's remote can trigger traffic on ids we do not manage.
    pub fn on_motion(&mut self, device_id: &str, event: MotionEvent, now: Instant) {
        let Some(device) = self.devices.get_mut(device_id) else {
            debug!(device_id, ?event, "motion from untracked device ignored");
            return;
        };

        // Whatever was moving until now, freeze its estimate first.
        device.profile.position = estimate(&device.profile, device.motion.as_ref(), now);
        device.profile.last_update = Some(Utc::now());

        match Direction::from_motion(event) {
            Some(direction) => {
                device.profile.last_direction = Some(direction);
                device.motion = Some(ActiveMotion {
                    direction,
                    started_at: now,
                    from: device.profile.position,
                });
            }
            None => {
                device.motion = None;
            }
        }
    }

    /// Estimated position of a motor at `now`.
    ///
    /// `None` when the motor is untracked, uncalibrated for the direction
    /// it moved in, or has no known reference position yet.
    pub fn position_at(&self, device_id: &str, now: Instant) -> Option<f64> {
        let device = self.devices.get(device_id)?;
        estimate(&device.profile, device.motion.as_ref(), now)
    }

    /// Record a measured travel time.
    ///
    /// A full-travel run ends at the corresponding endpoint, so the
    /// position becomes known even if it never was before.
    pub fn set_duration(&mut self, device_id: &str, direction: Direction, duration: Duration) {
        if let Some(device) = self.devices.get_mut(device_id) {
            match direction {
                Direction::Up => {
                    device.profile.open_duration = Some(duration);
                    device.profile.position = Some(1.0);
                }
                Direction::Down => {
                    device.profile.close_duration = Some(duration);
                    device.profile.position = Some(0.0);
                }
            }
            device.motion = None;
            device.profile.last_update = Some(Utc::now());
        }
    }

    /// Overwrite the reference position, e.g. after the host asked the
    /// user where the blind physically is.
    pub fn set_position(&mut self, device_id: &str, position: f64) {
        if let Some(device) = self.devices.get_mut(device_id) {
            device.profile.position = Some(position.clamp(0.0, 1.0));
            device.motion = None;
            device.profile.last_update = Some(Utc::now());
        }
    }
}

fn estimate(
    profile: &CalibrationProfile,
    motion: Option<&ActiveMotion>,
    now: Instant,
) -> Option<f64> {
    let Some(motion) = motion else {
        return profile.position;
    };
    let from = motion.from?;
    let full = match motion.direction {
        Direction::Up => profile.open_duration,
        Direction::Down => profile.close_duration,
    }?;
    if full.is_zero() {
        return Some(from);
    }
    let elapsed = now.saturating_duration_since(motion.started_at);
    let delta = elapsed.as_secs_f64() / full.as_secs_f64();
    let raw = match motion.direction {
        Direction::Up => from + delta,
        Direction::Down => from - delta,
    };
    Some(raw.clamp(0.0, 1.0))
}

/// One calibration measurement: armed, then timing, then done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRun {
    /// Waiting for the motor to start moving in the measured direction
    Armed {
        /// Direction this run measures
        direction: Direction,
    },
    /// Motor is moving; clock is running
    Timing {
        /// Direction this run measures
        direction: Direction,
        /// When the motion-start event arrived
        started_at: Instant,
    },
    /// Motor stopped; travel time captured
    Done {
        /// Direction this run measured
        direction: Direction,
        /// Elapsed time between start and stop
        duration: Duration,
    },
}

impl PhaseRun {
    /// Arm a measurement for `direction`
    pub fn new(direction: Direction) -> Self {
        PhaseRun::Armed { direction }
    }

    /// Feed a motion event from the motor under calibration. Returns the
    /// measured duration when this event finished the run.
    pub fn on_motion(&mut self, event: MotionEvent, now: Instant) -> Option<Duration> {
        match (*self, event) {
            (PhaseRun::Armed { direction } | PhaseRun::Timing { direction, .. }, start)
                if Direction::from_motion(start) == Some(direction) =>
            {
                // A restart re-arms the clock; only the final
                // uninterrupted run counts.
                *self = PhaseRun::Timing {
                    direction,
                    started_at: now,
                };
                None
            }
            (PhaseRun::Timing { direction, started_at }, MotionEvent::Stopped) => {
                let duration = now.saturating_duration_since(started_at);
                *self = PhaseRun::Done {
                    direction,
                    duration,
                };
                Some(duration)
            }
            _ => None,
        }
    }
}
