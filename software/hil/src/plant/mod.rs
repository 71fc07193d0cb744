//! Fixed-period plant loop.
//!
//! Each tick applies the newest command (or holds the last one), integrates
//! the plant dynamics, runs the safety checks and emits the next state frame.
//! [`PlantServer::tick`] takes the tick time explicitly, so the tick logic
//! runs the same under a wall clock, a manual clock or in a test.

mod intake;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info, warn};

use hil_shared::{MAX_PAYLOAD_VALUES, StateFrame};

use crate::clock::Clock;
use crate::deadline::{DeadlineRecord, DeadlineStatus, DeadlineTracker};
use crate::dynamics::Plant;
use crate::error::TransportError;
use crate::fault::FaultInjector;
use crate::safety::{
    EmergencyReason, SafetyMonitor, SafetySignals, SafetyStatus, SharedSafetyStatus,
};
use crate::session::{SessionConfig, SessionOutcome, Termination};
use crate::telemetry::{TelemetrySender, TickRecord};
use crate::transport::Transport;

pub use intake::IntakeStats;
use intake::CommandIntake;

/// Outcome of one plant tick.
#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    /// State frame for this tick, before fault injection
    pub frame: StateFrame,

    /// Command applied during this tick, after clamping
    pub applied_command: f64,

    /// Sequence of the command accepted on this tick, if one was
    pub accepted: Option<u64>,

    /// Consecutive ticks without a fresh command
    pub held_ticks: u32,

    /// Round-trip timing of every state frame first answered on this tick,
    /// oldest first
    pub deadlines: Vec<DeadlineRecord>,

    /// Worst classification among `deadlines`
    pub deadline_status: DeadlineStatus,
    pub window_miss_count: usize,

    pub status: SafetyStatus,
}

/// The plant side of a session.
pub struct PlantServer {
    plant: Box<dyn Plant>,
    state: Vec<f64>,
    dt: f64,

    hold_limit: u32,
    startup_grace_ticks: u32,

    tracker: DeadlineTracker,
    safety: SafetyMonitor,
    faults: FaultInjector,
    intake: CommandIntake,
    telemetry: Option<TelemetrySender>,

    next_sequence: u64,
    command: f64,
    has_command: bool,
    held_ticks: u32,
    startup_ticks: u32,
    disconnected: bool,
    ticks: u64,
}

impl PlantServer {
    /// # Panics
    ///
    /// If `initial_state` has more than [`MAX_PAYLOAD_VALUES`] components,
    /// too many to publish in a state frame.
    pub fn new(plant: Box<dyn Plant>, initial_state: Vec<f64>, cfg: &SessionConfig) -> Self {
        assert!(
            initial_state.len() <= MAX_PAYLOAD_VALUES,
            "initial state has {} components, more than a state frame carries",
            initial_state.len()
        );
        Self {
            plant,
            state: initial_state,
            dt: cfg.tick_period(),
            hold_limit: cfg.hold_last_value_limit,
            startup_grace_ticks: cfg.startup_grace_ticks,
            tracker: DeadlineTracker::new(cfg.command_deadline(), cfg.m, cfg.k),
            safety: SafetyMonitor::new(
                cfg.actuator_bound,
                cfg.state_bounds.clone(),
                cfg.hold_last_value_limit,
            ),
            faults: FaultInjector::new(cfg.fault_schedule.clone(), cfg.fault_seed),
            intake: CommandIntake::default(),
            telemetry: None,
            next_sequence: 1,
            command: 0.0,
            has_command: false,
            held_ticks: 0,
            startup_ticks: 0,
            disconnected: false,
            ticks: 0,
        }
    }

    /// Publish the safety status to a cell shared with a co-located controller.
    pub fn with_shared_status(mut self, shared: SharedSafetyStatus) -> Self {
        self.safety = self.safety.with_shared(shared);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySender) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Hand over a frame received from the controller at `arrival_time`.
    /// It is decoded and considered on the next tick.
    pub fn receive(&mut self, arrival_time: f64, bytes: Vec<u8>) {
        self.intake.push(arrival_time, bytes);
    }

    /// Record that the controller link is gone. The next tick stops the plant.
    pub fn mark_disconnected(&mut self) {
        self.disconnected = true;
    }

    /// Run one tick at session time `now`.
    pub fn tick(&mut self, now: f64) -> TickReport {
        let delivered = self.intake.deliver(now, &self.faults);

        let mut signals = SafetySignals {
            disconnected: self.disconnected,
            ..Default::default()
        };

        let mut deadlines = Vec::with_capacity(delivered.round_trips.len());
        let mut deadline_status = DeadlineStatus::Nominal;
        for (scheduled, actual) in delivered.round_trips {
            let (record, status) = self.tracker.record(scheduled, actual);
            deadline_status = deadline_status.max(status);
            match status {
                DeadlineStatus::Nominal => (),
                DeadlineStatus::Warning => warn!(
                    "Command for cycle {} arrived {:.3} ms after its state frame",
                    record.cycle_index,
                    record.latency() * 1e3
                ),
                DeadlineStatus::EmergencyTriggered => {
                    signals.deadline = DeadlineStatus::EmergencyTriggered
                }
            }
            deadlines.push(record);
        }

        let accepted = delivered.newest.map(|c| c.sequence);
        if let Some(c) = delivered.newest {
            self.command = c.command;
            self.has_command = true;
            self.held_ticks = 0;
        } else if self.has_command {
            self.held_ticks += 1;
            warn!(
                "No fresh command on tick {}; holding {} ({} in a row)",
                self.next_sequence, self.command, self.held_ticks
            );
        } else {
            self.startup_ticks += 1;
            signals.unresponsive = self.startup_ticks > self.startup_grace_ticks;
        }
        signals.held_ticks = self.held_ticks;

        let (u, _) = self.safety.check(&self.state, self.command, &signals);
        let next = self.plant.step(&self.state, u, self.dt);
        let (_, status) = self.safety.check(&next, u, &signals);
        if next.len() <= MAX_PAYLOAD_VALUES {
            self.state = next;
        }

        let frame = StateFrame {
            sequence: self.next_sequence,
            tick_time: now,
            state: self.state.clone(),
        };
        self.intake.note_sent(frame.sequence, now);
        self.next_sequence += 1;
        self.ticks += 1;

        let report = TickReport {
            frame,
            applied_command: u,
            accepted,
            held_ticks: self.held_ticks,
            deadlines,
            deadline_status,
            window_miss_count: self.tracker.window_miss_count(),
            status,
        };

        if let Some(telemetry) = &self.telemetry {
            telemetry.tick(TickRecord {
                sequence: report.frame.sequence,
                tick_time: now,
                state: report.frame.state.clone(),
                applied_command: u,
                held_ticks: report.held_ticks,
                deadlines: report.deadlines.clone(),
                deadline_status: report.deadline_status,
                window_miss_count: report.window_miss_count,
                safety_status: status,
                active_faults: self.faults.active_labels(now),
            });
        }

        report
    }

    /// Run ticks every `tick_period` until a termination criterion is met,
    /// `stop` is set, or the safety monitor stops the plant.
    ///
    /// Frames from the controller are read between ticks, waiting no later
    /// than the next tick time. The transport is left open for the caller.
    pub fn run(
        &mut self,
        transport: &mut dyn Transport,
        clock: &dyn Clock,
        stop: &AtomicBool,
        termination: &[Termination],
    ) -> Result<SessionOutcome, TransportError> {
        #[cfg(feature = "affinity")]
        pin_to_first_core();

        let start = clock.now();
        let mut target = start;
        let mut buf = Vec::new();

        info!("Entering plant loop with {:.3} ms ticks", self.dt * 1e3);
        let outcome = loop {
            // Check exit criteria
            if stop.load(Ordering::Relaxed) {
                break SessionOutcome::Stopped;
            }
            let elapsed = clock.now() - start;
            if termination.iter().any(|t| t.reached(self.ticks, elapsed)) {
                break SessionOutcome::Completed;
            }

            // Take in commands until the next tick is due
            while !self.disconnected {
                let remaining = target - clock.now();
                let timeout = if remaining > 0.0 {
                    Duration::from_secs_f64(remaining)
                } else {
                    Duration::ZERO
                };
                match transport.recv(timeout) {
                    Ok(Some(bytes)) => self.receive(clock.now(), bytes),
                    Ok(None) if remaining <= 0.0 => break,
                    Ok(None) => (),
                    Err(TransportError::Disconnected) => {
                        error!("Controller link disconnected");
                        self.disconnected = true;
                    }
                    Err(e) => return Err(e),
                }
            }
            if self.disconnected {
                // No link to wait on; keep the tick period anyway
                let remaining = target - clock.now();
                if remaining > 0.0 {
                    std::thread::sleep(Duration::from_secs_f64(remaining));
                }
            }

            let now = clock.now();
            let report = self.tick(now);
            if report.status == SafetyStatus::EmergencyStop {
                break SessionOutcome::EmergencyStop;
            }

            report.frame.encode_into(&mut buf);
            match transport.send(&buf) {
                Ok(()) => (),
                Err(TransportError::Disconnected) => {
                    error!("Controller link disconnected");
                    self.disconnected = true;
                }
                Err(e) => return Err(e),
            }

            // Update next target time, skipping ticks that can no longer be made
            target += self.dt;
            if now > target + self.dt {
                warn!(
                    "Plant loop fell behind by {:.3} ms; resynchronizing",
                    (now - target) * 1e3
                );
                target = now + self.dt;
            }
        };

        info!("Plant loop finished after {} ticks: {outcome:?}", self.ticks);
        Ok(outcome)
    }

    pub fn state(&self) -> &[f64] {
        &self.state
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn status(&self) -> SafetyStatus {
        self.safety.status()
    }

    pub fn emergency_reason(&self) -> Option<EmergencyReason> {
        self.safety.reason()
    }

    pub fn deadline_tracker(&self) -> &DeadlineTracker {
        &self.tracker
    }

    pub fn intake_stats(&self) -> IntakeStats {
        self.intake.stats()
    }

    pub fn shared_status(&self) -> SharedSafetyStatus {
        self.safety.shared()
    }
}

/// Give the plant loop the first core, which is more likely to be a
/// high-performance core, at the highest available priority.
/// Not every platform allows this, so failures are ignored.
#[cfg(feature = "affinity")]
fn pin_to_first_core() {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    if let Some(core) = core_ids.first() {
        core_affinity::set_for_current(*core);
    }
    let _ = thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max);
}
