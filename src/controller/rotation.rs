//! Write gate for star rotation.
//!
//! The rotation DP carries both on/off and speed, so host toggles and speed
//! writes must not race. Toggles are debounced; speed writes go straight
//! out (or queue behind the one in flight); after every completed write a
//! cooldown keeps late toggles from undoing it.
//!
//! `Idle -> PendingToggle -> WriteInFlight -> Cooldown -> Idle`

use crate::accessory::{ROTATION_SPEED_MAX, ROTATION_SPEED_MIN};
use tokio::time::{Duration, Instant};

pub const TOGGLE_DEBOUNCE: Duration = Duration::from_millis(500);
pub const SPEED_COOLDOWN: Duration = Duration::from_millis(600);

/// Device value is speed × 10.
pub const DEVICE_SCALE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    Idle,
    PendingToggle { active: bool, at: Instant },
    WriteInFlight,
    Cooldown { until: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Scheduled,
    /// Toggled back to the displayed value before the debounce fired.
    Cancelled,
    /// A write is in flight or cooling down.
    Suppressed,
    /// Already in the requested state.
    Unchanged,
}

/// A speed to send to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationWrite {
    pub speed: u8,
    pub from_toggle: bool,
}

impl RotationWrite {
    pub fn device_value(&self) -> u32 {
        self.speed as u32 * DEVICE_SCALE
    }
}

/// Device rotation value to `(speed, active)`.
pub fn from_device(raw: u64) -> (u8, bool) {
    let speed = (raw / DEVICE_SCALE as u64).clamp(ROTATION_SPEED_MIN as u64, ROTATION_SPEED_MAX as u64);
    (speed as u8, raw > DEVICE_SCALE as u64)
}

#[derive(Debug, Clone)]
pub struct RotationGate {
    phase: RotationPhase,
    queued_speed: Option<u8>,
}

impl Default for RotationGate {
    fn default() -> Self {
        Self {
            phase: RotationPhase::Idle,
            queued_speed: None,
        }
    }
}

impl RotationGate {
    pub fn phase(&self) -> RotationPhase {
        self.phase
    }

    /// Host toggle of the active characteristic, `current` being what the
    /// host displays right now.
    pub fn request_toggle(&mut self, active: bool, current: bool, now: Instant) -> ToggleOutcome {
        match self.phase {
            RotationPhase::WriteInFlight | RotationPhase::Cooldown { .. } => ToggleOutcome::Suppressed,
            RotationPhase::PendingToggle { .. } if active == current => {
                self.phase = RotationPhase::Idle;
                ToggleOutcome::Cancelled
            }
            RotationPhase::Idle if active == current => ToggleOutcome::Unchanged,
            RotationPhase::Idle | RotationPhase::PendingToggle { .. } => {
                self.phase = RotationPhase::PendingToggle {
                    active,
                    at: now + TOGGLE_DEBOUNCE,
                };
                ToggleOutcome::Scheduled
            }
        }
    }

    /// Host speed write. Cancels a pending toggle; queues behind a write in
    /// flight.
    pub fn request_speed(&mut self, speed: u8) -> Option<RotationWrite> {
        let speed = speed.clamp(ROTATION_SPEED_MIN, ROTATION_SPEED_MAX);
        if self.phase == RotationPhase::WriteInFlight {
            self.queued_speed = Some(speed);
            return None;
        }
        self.phase = RotationPhase::WriteInFlight;
        Some(RotationWrite {
            speed,
            from_toggle: false,
        })
    }

    /// When the owning task must call [`Self::on_deadline`].
    pub fn deadline(&self) -> Option<Instant> {
        match self.phase {
            RotationPhase::PendingToggle { at, .. } => Some(at),
            RotationPhase::Cooldown { until } => Some(until),
            _ => None,
        }
    }

    pub fn on_deadline(&mut self, now: Instant) -> Option<RotationWrite> {
        match self.phase {
            RotationPhase::PendingToggle { active, at } if at <= now => {
                self.phase = RotationPhase::WriteInFlight;
                Some(RotationWrite {
                    speed: if active { ROTATION_SPEED_MAX } else { ROTATION_SPEED_MIN },
                    from_toggle: true,
                })
            }
            RotationPhase::Cooldown { until } if until <= now => {
                self.phase = RotationPhase::Idle;
                None
            }
            _ => None,
        }
    }

    /// Finishes the write in flight, successful or not. Returns the queued
    /// speed write if there is one, otherwise enters cooldown.
    pub fn on_write_complete(&mut self, now: Instant) -> Option<RotationWrite> {
        if let Some(speed) = self.queued_speed.take() {
            self.phase = RotationPhase::WriteInFlight;
            return Some(RotationWrite {
                speed,
                from_toggle: false,
            });
        }
        self.phase = RotationPhase::Cooldown {
            until: now + SPEED_COOLDOWN,
        };
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_is_debounced() {
        let now = Instant::now();
        let mut gate = RotationGate::default();
        assert_eq!(gate.request_toggle(true, false, now), ToggleOutcome::Scheduled);
        assert_eq!(gate.deadline(), Some(now + TOGGLE_DEBOUNCE));
        assert_eq!(gate.on_deadline(now + Duration::from_millis(100)), None);

        let write = gate.on_deadline(now + TOGGLE_DEBOUNCE).unwrap();
        assert_eq!(write.speed, 100);
        assert_eq!(write.device_value(), 1000);
        assert!(write.from_toggle);
        assert_eq!(gate.phase(), RotationPhase::WriteInFlight);
    }

    #[test]
    fn test_toggle_back_cancels() {
        let now = Instant::now();
        let mut gate = RotationGate::default();
        gate.request_toggle(true, false, now);
        assert_eq!(gate.request_toggle(false, false, now), ToggleOutcome::Cancelled);
        assert_eq!(gate.deadline(), None);
        assert_eq!(gate.request_toggle(false, false, now), ToggleOutcome::Unchanged);
    }

    #[test]
    fn test_toggles_suppressed_until_cooldown_ends() {
        let now = Instant::now();
        let mut gate = RotationGate::default();
        let write = gate.request_speed(40).unwrap();
        assert_eq!(write.device_value(), 400);
        assert_eq!(gate.request_toggle(false, true, now), ToggleOutcome::Suppressed);

        assert_eq!(gate.on_write_complete(now), None);
        assert_eq!(gate.request_toggle(false, true, now), ToggleOutcome::Suppressed);

        gate.on_deadline(now + SPEED_COOLDOWN);
        assert_eq!(gate.phase(), RotationPhase::Idle);
        assert_eq!(gate.request_toggle(false, true, now), ToggleOutcome::Scheduled);
    }

    #[test]
    fn test_speed_cancels_pending_toggle_and_queues() {
        let now = Instant::now();
        let mut gate = RotationGate::default();
        gate.request_toggle(true, false, now);
        assert_eq!(gate.request_speed(30).map(|w| w.speed), Some(30));
        assert_eq!(gate.request_speed(50), None);
        assert_eq!(gate.request_speed(0), None);

        let next = gate.on_write_complete(now).unwrap();
        assert_eq!(next.speed, 1);
        assert_eq!(gate.on_write_complete(now), None);
        assert!(matches!(gate.phase(), RotationPhase::Cooldown { .. }));
    }

    #[test]
    fn test_device_value_mapping() {
        assert_eq!(from_device(0), (1, false));
        assert_eq!(from_device(10), (1, false));
        assert_eq!(from_device(500), (50, true));
        assert_eq!(from_device(5000), (100, true));
    }
}
