//! Deadline-bounded controller loop.
//!
//! Receives state frames, runs the control law on each and answers with a
//! command frame that echoes the state frame's sequence number. A failing or
//! panicking control law never ends the loop; the last command it produced
//! successfully is sent in its place.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flaw::MedianFilter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use hil_shared::{CommandFrame, Frame, StateFrame, decode};

use crate::clock::Clock;
use crate::deadline::{DeadlineStatus, DeadlineTracker};
use crate::dynamics::ControlLaw;
use crate::error::{ComputeError, TransportError};
use crate::fault::FaultInjector;
use crate::safety::SharedSafetyStatus;
use crate::session::SessionConfig;
use crate::telemetry::{ControllerRecord, TelemetrySender};
use crate::transport::Transport;

/// Counters describing a controller run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct ControllerReport {
    /// State frames answered
    pub cycles: u64,

    /// Receive timeouts with no state frame
    pub lost_frames: u64,

    pub malformed_frames: u64,

    /// State frames not newer than one already answered
    pub out_of_order: u64,

    /// State frames lost to a drop fault
    pub fault_dropped: u64,

    /// Cycles where the control law failed and the last safe command was sent
    pub compute_failures: u64,

    /// Cycles whose compute time exceeded the command deadline
    pub deadline_misses: u64,

    pub last_command: f64,
}

/// The controller side of a session.
pub struct ControllerClient {
    law: Box<dyn ControlLaw>,
    deadline: f64,
    tracker: DeadlineTracker,
    faults: FaultInjector,
    shared: Option<SharedSafetyStatus>,
    telemetry: Option<TelemetrySender>,

    last_safe_command: f64,
    last_sequence: Option<u64>,
    compute_time_filter: MedianFilter<i64, 7>,
    report: ControllerReport,
}

impl ControllerClient {
    pub fn new(law: Box<dyn ControlLaw>, cfg: &SessionConfig) -> Self {
        Self {
            law,
            deadline: cfg.command_deadline(),
            tracker: DeadlineTracker::new(cfg.command_deadline(), cfg.m, cfg.k),
            faults: FaultInjector::new(cfg.fault_schedule.clone(), cfg.fault_seed),
            shared: None,
            telemetry: None,
            last_safe_command: 0.0,
            last_sequence: None,
            compute_time_filter: MedianFilter::<i64, 7>::new(0),
            report: ControllerReport::default(),
        }
    }

    /// Watch a co-located plant's safety status and stop on emergency.
    pub fn with_shared_status(mut self, shared: SharedSafetyStatus) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySender) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Decode and fault-inject a frame received at `now`.
    ///
    /// Returns the state frame to answer and how much longer its delivery
    /// is delayed by injected latency, or `None` if it must be ignored.
    pub fn admit(&mut self, now: f64, bytes: &[u8]) -> Option<(StateFrame, Duration)> {
        let frame = match decode(bytes) {
            Ok(Frame::State(s)) => s,
            Ok(Frame::Command(c)) => {
                self.report.malformed_frames += 1;
                warn!("Controller received a command frame (sequence {}); dropped", c.sequence);
                return None;
            }
            Err(e) => {
                self.report.malformed_frames += 1;
                warn!("Dropped malformed state frame: {e}");
                return None;
            }
        };

        let sequence = frame.sequence;
        let tick_time = frame.tick_time;
        let Some(Frame::State(mut frame)) = self.faults.apply(now, frame.into()) else {
            self.report.fault_dropped += 1;
            debug!("State frame {sequence} dropped by fault injection");
            return None;
        };
        let delay = (frame.tick_time - tick_time).max(0.0);
        frame.tick_time = tick_time;

        if self.last_sequence.is_some_and(|s| sequence <= s) {
            self.report.out_of_order += 1;
            debug!("Ignored out-of-order state frame {sequence}");
            return None;
        }
        self.last_sequence = Some(sequence);

        Some((frame, Duration::from_secs_f64(delay)))
    }

    /// Compute the command answering `frame`, received at `receipt_time`.
    pub fn respond(
        &mut self,
        frame: &StateFrame,
        receipt_time: f64,
        clock: &dyn Clock,
    ) -> CommandFrame {
        let law = &mut self.law;
        let result = match catch_unwind(AssertUnwindSafe(|| law.compute(&frame.state))) {
            Ok(Ok(u)) if u.is_finite() => Ok(u),
            Ok(Ok(u)) => Err(ComputeError::NonFinite(u)),
            Ok(Err(e)) => Err(e),
            Err(payload) => Err(ComputeError::Panicked(panic_message(payload.as_ref()))),
        };
        let completion_time = clock.now();

        let compute_failed = result.is_err();
        let command = match result {
            Ok(u) => {
                self.last_safe_command = u;
                u
            }
            Err(e) => {
                self.report.compute_failures += 1;
                warn!(
                    "{e} on state frame {}; sending last safe command {}",
                    frame.sequence, self.last_safe_command
                );
                self.last_safe_command
            }
        };

        let (record, status) = self.tracker.record(receipt_time, completion_time);
        match status {
            DeadlineStatus::Nominal => (),
            DeadlineStatus::Warning => warn!(
                "Compute for state frame {} took {:.3} ms, over the {:.3} ms deadline",
                frame.sequence,
                record.latency() * 1e3,
                self.deadline * 1e3
            ),
            DeadlineStatus::EmergencyTriggered => warn!(
                "Compute time broke the (m,k) constraint at state frame {}",
                frame.sequence
            ),
        }
        if record.missed {
            self.report.deadline_misses += 1;
        }

        let compute_ns = (record.latency() * 1e9) as i64;
        let filtered_compute_time_ns = self.compute_time_filter.update(compute_ns);

        if let Some(telemetry) = &self.telemetry {
            telemetry.controller(ControllerRecord {
                cycle_index: record.cycle_index,
                state_sequence: frame.sequence,
                receipt_time,
                completion_time,
                command,
                compute_failed,
                missed: record.missed,
                window_miss_count: self.tracker.window_miss_count(),
                filtered_compute_time_ns,
            });
        }

        self.report.cycles += 1;
        self.report.last_command = command;

        CommandFrame {
            sequence: frame.sequence,
            issued_time: completion_time,
            command,
        }
    }

    /// Answer state frames until `stop` is set, the co-located plant stops,
    /// or the link is closed by the plant.
    ///
    /// A state frame that does not arrive within twice the command deadline
    /// is counted as lost. The transport is left open for the caller.
    pub fn run(
        &mut self,
        transport: &mut dyn Transport,
        clock: &dyn Clock,
        stop: &AtomicBool,
    ) -> Result<ControllerReport, TransportError> {
        let timeout = Duration::from_secs_f64(2.0 * self.deadline);
        let mut buf = Vec::new();

        info!("Entering controller loop");
        loop {
            // Check exit criteria
            if stop.load(Ordering::Relaxed) {
                break;
            }
            if self.shared.as_ref().is_some_and(|s| s.is_emergency()) {
                info!("Plant is in emergency stop; controller exiting");
                break;
            }

            let bytes = match transport.recv(timeout) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    self.report.lost_frames += 1;
                    warn!(
                        "No state frame within {:.3} ms ({} lost so far)",
                        timeout.as_secs_f64() * 1e3,
                        self.report.lost_frames
                    );
                    continue;
                }
                Err(TransportError::Disconnected) => {
                    info!("Plant closed the link; controller exiting");
                    break;
                }
                Err(e) => return Err(e),
            };

            let Some((frame, delay)) = self.admit(clock.now(), &bytes) else {
                continue;
            };
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }

            let receipt_time = clock.now();
            let cmd = self.respond(&frame, receipt_time, clock);
            cmd.encode_into(&mut buf);
            match transport.send(&buf) {
                Ok(()) => (),
                Err(TransportError::Disconnected) => {
                    info!("Plant closed the link; controller exiting");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Controller loop finished after {} cycles ({} compute failures, {} lost frames)",
            self.report.cycles, self.report.compute_failures, self.report.lost_frames
        );
        Ok(self.report)
    }

    pub fn report(&self) -> ControllerReport {
        self.report
    }

    pub fn deadline_tracker(&self) -> &DeadlineTracker {
        &self.tracker
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
