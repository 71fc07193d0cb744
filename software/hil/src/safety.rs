//! Actuator clamping, bound checks and the emergency stop latch.

use std::fmt;
use std::sync::{Arc, Mutex};

use hil_shared::MAX_PAYLOAD_VALUES;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::deadline::DeadlineStatus;

/// Safety state of a session.
///
/// Ordered by severity. Within a session it only moves toward
/// `EmergencyStop`, and never leaves it.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum SafetyStatus {
    #[default]
    Nominal,

    /// At least one command had to be clamped to the actuator bound
    Saturated,

    /// Only the safe command is applied from here on
    EmergencyStop,
}

impl SafetyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyStatus::Nominal => "nominal",
            SafetyStatus::Saturated => "saturated",
            SafetyStatus::EmergencyStop => "emergency_stop",
        }
    }
}

impl fmt::Display for SafetyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused an emergency stop.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmergencyReason {
    /// A state component left its bound or became non-finite
    StateBound { index: usize },

    /// The (m,k) deadline constraint was breached
    DeadlineBreach,

    /// More than the allowed number of consecutive ticks without a fresh command
    HoldLimit,

    /// No command arrived at all during startup
    ControllerUnresponsive,

    /// The link to the controller was lost
    Disconnected,
}

impl fmt::Display for EmergencyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmergencyReason::StateBound { index } => write!(f, "state[{index}] out of bounds"),
            EmergencyReason::DeadlineBreach => write!(f, "(m,k) deadline constraint breached"),
            EmergencyReason::HoldLimit => write!(f, "hold-last-value limit exceeded"),
            EmergencyReason::ControllerUnresponsive => {
                write!(f, "no command received during startup")
            }
            EmergencyReason::Disconnected => write!(f, "controller link disconnected"),
        }
    }
}

/// Conditions observed by the plant loop during one tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct SafetySignals {
    /// Deadline classification of the command accepted this tick, if any
    pub deadline: DeadlineStatus,

    /// Consecutive ticks the current command has been held
    pub held_ticks: u32,

    /// Startup grace expired with no command
    pub unresponsive: bool,

    /// The link reported a disconnect
    pub disconnected: bool,
}

/// Read side of the authoritative safety status, for co-located loops.
///
/// Only [`SafetyMonitor::check`] writes to it.
#[derive(Clone, Debug, Default)]
pub struct SharedSafetyStatus {
    inner: Arc<Mutex<SafetyStatus>>,
}

impl SharedSafetyStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest published status. A poisoned cell reads as `EmergencyStop`.
    pub fn get(&self) -> SafetyStatus {
        self.inner
            .lock()
            .map(|s| *s)
            .unwrap_or(SafetyStatus::EmergencyStop)
    }

    pub fn is_emergency(&self) -> bool {
        self.get() == SafetyStatus::EmergencyStop
    }

    fn publish(&self, status: SafetyStatus) {
        match self.inner.lock() {
            Ok(mut s) => *s = (*s).max(status),
            Err(poisoned) => *poisoned.into_inner() = SafetyStatus::EmergencyStop,
        }
    }
}

/// Owner of the one authoritative [`SafetyStatus`] of a session.
#[derive(Debug)]
pub struct SafetyMonitor {
    actuator_bound: f64,
    state_bounds: Vec<f64>,
    hold_limit: u32,

    status: SafetyStatus,
    reason: Option<EmergencyReason>,
    clamped: u64,
    shared: SharedSafetyStatus,
}

impl SafetyMonitor {
    /// `state_bounds[i]` bounds `|state[i]|`; components without an entry are unbounded.
    pub fn new(actuator_bound: f64, state_bounds: Vec<f64>, hold_limit: u32) -> Self {
        Self {
            actuator_bound,
            state_bounds,
            hold_limit,
            status: SafetyStatus::Nominal,
            reason: None,
            clamped: 0,
            shared: SharedSafetyStatus::new(),
        }
    }

    /// Publish to an existing shared cell instead of a private one.
    pub fn with_shared(mut self, shared: SharedSafetyStatus) -> Self {
        shared.publish(self.status);
        self.shared = shared;
        self
    }

    /// Clamp a command and update the safety status.
    ///
    /// Returns the command that may be applied and the status after this check.
    /// Once in `EmergencyStop`, the command is always the safe command `0.0`.
    pub fn check(
        &mut self,
        state: &[f64],
        command: f64,
        signals: &SafetySignals,
    ) -> (f64, SafetyStatus) {
        if self.status == SafetyStatus::EmergencyStop {
            return (0.0, self.status);
        }

        if let Some(reason) = self.emergency_reason(state, signals) {
            self.status = SafetyStatus::EmergencyStop;
            self.reason = Some(reason);
            self.shared.publish(self.status);
            error!("Emergency stop: {reason}");
            return (0.0, self.status);
        }

        let u_max = self.actuator_bound;
        let applied = if command.is_finite() {
            command.clamp(-u_max, u_max)
        } else {
            0.0
        };
        if applied != command {
            self.clamped += 1;
            if self.status == SafetyStatus::Nominal {
                warn!("Actuator command {command} clamped to {applied}");
            }
            self.status = self.status.max(SafetyStatus::Saturated);
        }

        self.shared.publish(self.status);
        (applied, self.status)
    }

    fn emergency_reason(&self, state: &[f64], signals: &SafetySignals) -> Option<EmergencyReason> {
        // Components past the frame capacity cannot be published
        if state.len() > MAX_PAYLOAD_VALUES {
            return Some(EmergencyReason::StateBound {
                index: MAX_PAYLOAD_VALUES,
            });
        }
        for (index, x) in state.iter().enumerate() {
            let bound = self.state_bounds.get(index).copied().unwrap_or(f64::INFINITY);
            if !x.is_finite() || x.abs() > bound {
                return Some(EmergencyReason::StateBound { index });
            }
        }

        if signals.disconnected {
            Some(EmergencyReason::Disconnected)
        } else if signals.deadline == DeadlineStatus::EmergencyTriggered {
            Some(EmergencyReason::DeadlineBreach)
        } else if signals.held_ticks > self.hold_limit {
            Some(EmergencyReason::HoldLimit)
        } else if signals.unresponsive {
            Some(EmergencyReason::ControllerUnresponsive)
        } else {
            None
        }
    }

    pub fn status(&self) -> SafetyStatus {
        self.status
    }

    /// Cause of the emergency stop, if one happened.
    pub fn reason(&self) -> Option<EmergencyReason> {
        self.reason
    }

    /// Number of commands that were clamped.
    pub fn clamped_count(&self) -> u64 {
        self.clamped
    }

    pub fn shared(&self) -> SharedSafetyStatus {
        self.shared.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> SafetySignals {
        SafetySignals::default()
    }

    #[test]
    fn commands_are_clamped_to_actuator_bound() {
        let mut monitor = SafetyMonitor::new(1.0, vec![], 3);
        assert_eq!(monitor.check(&[0.0], 0.5, &quiet()), (0.5, SafetyStatus::Nominal));
        assert_eq!(monitor.check(&[0.0], 1.0, &quiet()), (1.0, SafetyStatus::Nominal));
        assert_eq!(monitor.check(&[0.0], 5.0, &quiet()), (1.0, SafetyStatus::Saturated));
        assert_eq!(monitor.check(&[0.0], -5.0, &quiet()), (-1.0, SafetyStatus::Saturated));

        // Status does not step back down
        assert_eq!(monitor.check(&[0.0], 0.2, &quiet()), (0.2, SafetyStatus::Saturated));
        assert_eq!(monitor.clamped_count(), 2);
    }

    #[test]
    fn state_too_large_to_publish_stops() {
        let mut monitor = SafetyMonitor::new(1.0, vec![], 3);
        let state = vec![0.0; MAX_PAYLOAD_VALUES + 1];
        assert_eq!(monitor.check(&state, 0.5, &quiet()), (0.0, SafetyStatus::EmergencyStop));
        assert_eq!(
            monitor.reason(),
            Some(EmergencyReason::StateBound {
                index: MAX_PAYLOAD_VALUES
            })
        );
    }

    #[test]
    fn state_bound_violation_stops() {
        let mut monitor = SafetyMonitor::new(1.0, vec![10.0, 2.0], 3);
        assert_eq!(monitor.check(&[9.0, 1.0, 1e9], 0.1, &quiet()).1, SafetyStatus::Nominal);
        assert_eq!(
            monitor.check(&[0.0, -2.5], 0.1, &quiet()),
            (0.0, SafetyStatus::EmergencyStop)
        );
        assert_eq!(monitor.reason(), Some(EmergencyReason::StateBound { index: 1 }));
    }

    #[test]
    fn emergency_stop_is_sticky() {
        let mut monitor = SafetyMonitor::new(1.0, vec![], 3);
        let shared = monitor.shared();
        let signals = SafetySignals {
            held_ticks: 4,
            ..Default::default()
        };
        assert_eq!(monitor.check(&[0.0], 0.5, &signals), (0.0, SafetyStatus::EmergencyStop));
        assert_eq!(monitor.reason(), Some(EmergencyReason::HoldLimit));
        assert!(shared.is_emergency());

        for _ in 0..10 {
            assert_eq!(monitor.check(&[0.0], 0.5, &quiet()), (0.0, SafetyStatus::EmergencyStop));
        }
        assert_eq!(monitor.reason(), Some(EmergencyReason::HoldLimit));
    }

    #[test]
    fn holding_up_to_the_limit_is_allowed() {
        let mut monitor = SafetyMonitor::new(1.0, vec![], 3);
        let signals = SafetySignals {
            held_ticks: 3,
            ..Default::default()
        };
        assert_eq!(monitor.check(&[0.0], 0.5, &signals), (0.5, SafetyStatus::Nominal));
    }

    #[test]
    fn deadline_breach_stops() {
        let mut monitor = SafetyMonitor::new(1.0, vec![], 3);
        let signals = SafetySignals {
            deadline: DeadlineStatus::EmergencyTriggered,
            ..Default::default()
        };
        assert_eq!(monitor.check(&[0.0], 0.5, &signals).1, SafetyStatus::EmergencyStop);
        assert_eq!(monitor.reason(), Some(EmergencyReason::DeadlineBreach));
    }

    #[test]
    fn shared_cell_follows_the_monitor() {
        let shared = SharedSafetyStatus::new();
        let mut monitor = SafetyMonitor::new(1.0, vec![], 3).with_shared(shared.clone());
        assert_eq!(shared.get(), SafetyStatus::Nominal);
        monitor.check(&[0.0], 2.0, &quiet());
        assert_eq!(shared.get(), SafetyStatus::Saturated);
        monitor.check(&[f64::NAN], 0.0, &quiet());
        assert_eq!(shared.get(), SafetyStatus::EmergencyStop);
    }
}
