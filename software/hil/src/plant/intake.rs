//! Inbound command handling on the plant side of the link.

use std::collections::VecDeque;

use tracing::{debug, warn};

use hil_shared::{CommandFrame, Frame, decode};

use crate::fault::FaultInjector;

/// Number of emitted state frames whose tick time is remembered
/// for round-trip timing.
const SENT_HISTORY: usize = 1024;

/// A command that got past fault injection and is waiting to be delivered.
#[derive(Clone, Copy, Debug)]
struct Pending {
    /// When the command reaches the plant, including injected latency
    effective_time: f64,
    frame: CommandFrame,
}

/// Counters for commands that were not applied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntakeStats {
    /// Could not be decoded as a command frame
    pub malformed: u64,

    /// Older than or equal to the command already applied
    pub stale: u64,

    /// Answering a state frame that was never sent
    pub invalid: u64,

    /// Lost to a drop fault
    pub fault_dropped: u64,
}

/// Commands delivered on one tick.
#[derive(Debug, Default)]
pub(crate) struct Delivered {
    /// Newest fresh command, if any
    pub newest: Option<CommandFrame>,

    /// `(tick time of the answered state frame, delivery time)`
    /// for each newly answered state frame, in sequence order
    pub round_trips: Vec<(f64, f64)>,
}

/// Receive-side bookkeeping for command frames.
#[derive(Debug, Default)]
pub(crate) struct CommandIntake {
    inbox: Vec<(f64, Vec<u8>)>,
    pending: Vec<Pending>,

    /// `(sequence, tick_time)` of recently emitted state frames
    sent: VecDeque<(u64, f64)>,
    last_sent: u64,

    /// Sequence of the newest command accepted so far
    applied: Option<u64>,

    /// Newest sequence whose round trip has been timed
    last_timed: u64,

    stats: IntakeStats,
}

impl CommandIntake {
    /// Queue raw bytes received at `arrival_time`.
    pub fn push(&mut self, arrival_time: f64, bytes: Vec<u8>) {
        self.inbox.push((arrival_time, bytes));
    }

    /// Remember when a state frame was emitted.
    pub fn note_sent(&mut self, sequence: u64, tick_time: f64) {
        if self.sent.len() == SENT_HISTORY {
            self.sent.pop_front();
        }
        self.sent.push_back((sequence, tick_time));
        self.last_sent = sequence;
    }

    pub fn stats(&self) -> IntakeStats {
        self.stats
    }

    pub fn applied(&self) -> Option<u64> {
        self.applied
    }

    fn sent_time(&self, sequence: u64) -> Option<f64> {
        let (first, _) = *self.sent.front()?;
        let i = sequence.checked_sub(first)? as usize;
        self.sent.get(i).map(|(_, t)| *t)
    }

    /// Decode and fault-inject everything received since the last tick,
    /// then deliver whatever is due by `now`.
    pub fn deliver(&mut self, now: f64, faults: &FaultInjector) -> Delivered {
        for (arrival_time, bytes) in std::mem::take(&mut self.inbox) {
            let frame = match decode(&bytes) {
                Ok(Frame::Command(c)) => c,
                Ok(Frame::State(s)) => {
                    self.stats.malformed += 1;
                    warn!("Plant received a state frame (sequence {}); dropped", s.sequence);
                    continue;
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!("Dropped malformed command frame: {e}");
                    continue;
                }
            };

            let issued_time = frame.issued_time;
            let Some(Frame::Command(mut frame)) = faults.apply(now, frame.into()) else {
                self.stats.fault_dropped += 1;
                debug!("Command {} dropped by fault injection", frame.sequence);
                continue;
            };

            // Injected latency shows up as a later stamp; turn it into a later delivery
            let delay = (frame.issued_time - issued_time).max(0.0);
            frame.issued_time = issued_time;
            self.pending.push(Pending {
                effective_time: arrival_time + delay,
                frame,
            });
        }

        let (mut due, waiting): (Vec<Pending>, Vec<Pending>) = self
            .pending
            .drain(..)
            .partition(|p| p.effective_time <= now);
        self.pending = waiting;
        due.sort_by_key(|p| p.frame.sequence);

        let mut delivered = Delivered::default();
        for p in due {
            let sequence = p.frame.sequence;
            if sequence == 0 || sequence > self.last_sent {
                self.stats.invalid += 1;
                warn!("Dropped command answering unknown state frame {sequence}");
                continue;
            }

            if sequence > self.last_timed {
                if let Some(tick_time) = self.sent_time(sequence) {
                    delivered.round_trips.push((tick_time, p.effective_time));
                }
                self.last_timed = sequence;
            }

            if self.applied.is_some_and(|a| sequence <= a) {
                self.stats.stale += 1;
                debug!("Discarded stale command {sequence}");
                continue;
            }
            if let Some(older) = delivered.newest.replace(p.frame) {
                self.stats.stale += 1;
                debug!("Command {} superseded by {sequence}", older.sequence);
            }
            self.applied = Some(sequence);
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultEvent, FaultKind, FaultTarget};

    fn cmd(sequence: u64, command: f64) -> Vec<u8> {
        CommandFrame {
            sequence,
            issued_time: 0.0,
            command,
        }
        .encode()
    }

    fn intake(sent: u64) -> CommandIntake {
        let mut intake = CommandIntake::default();
        for s in 1..=sent {
            intake.note_sent(s, s as f64 * 0.01);
        }
        intake
    }

    #[test]
    fn newest_command_wins_and_older_ones_are_stale() {
        let mut intake = intake(10);
        let none = FaultInjector::default();

        intake.push(0.1, cmd(5, 0.5));
        intake.push(0.1, cmd(4, 0.4));
        let d = intake.deliver(0.11, &none);
        assert_eq!(d.newest.map(|c| c.sequence), Some(5));
        assert_eq!(intake.stats().stale, 1);

        // Late arrival of an older command, and a duplicate
        intake.push(0.12, cmd(3, 0.3));
        intake.push(0.12, cmd(5, 0.5));
        let d = intake.deliver(0.12, &none);
        assert!(d.newest.is_none());
        assert_eq!(intake.stats().stale, 3);
        assert_eq!(intake.applied(), Some(5));
    }

    #[test]
    fn unknown_sequences_and_garbage_are_rejected() {
        let mut intake = intake(3);
        let none = FaultInjector::default();
        intake.push(0.0, cmd(4, 0.0));
        intake.push(0.0, cmd(0, 0.0));
        intake.push(0.0, vec![1, 2, 3]);
        let d = intake.deliver(0.0, &none);
        assert!(d.newest.is_none());
        assert_eq!(intake.stats().invalid, 2);
        assert_eq!(intake.stats().malformed, 1);
    }

    #[test]
    fn round_trip_is_timed_once_per_state_frame() {
        let mut intake = intake(2);
        let none = FaultInjector::default();
        intake.push(0.013, cmd(1, 0.0));
        intake.push(0.014, cmd(1, 0.0));
        let d = intake.deliver(0.02, &none);
        assert_eq!(d.round_trips, vec![(0.01, 0.013)]);
    }

    #[test]
    fn latency_fault_delays_delivery() {
        let mut intake = intake(1);
        let faults = FaultInjector::new(
            vec![FaultEvent::new(FaultKind::Latency(15.0), 0.0, 1.0, FaultTarget::Command)],
            0,
        );
        intake.push(0.013, cmd(1, 0.25));
        assert!(intake.deliver(0.02, &faults).newest.is_none());

        let d = intake.deliver(0.03, &faults);
        let c = d.newest.unwrap();
        assert_eq!(c.command, 0.25);
        assert_eq!(c.issued_time, 0.0);
        assert_eq!(d.round_trips.len(), 1);
        assert!((d.round_trips[0].1 - 0.028).abs() < 1e-12);
    }

    #[test]
    fn drop_fault_counts_lost_commands() {
        let mut intake = intake(1);
        let faults = FaultInjector::new(
            vec![FaultEvent::new(FaultKind::Drop, 0.0, 1.0, FaultTarget::Command)],
            0,
        );
        intake.push(0.013, cmd(1, 0.25));
        assert!(intake.deliver(0.02, &faults).newest.is_none());
        assert_eq!(intake.stats().fault_dropped, 1);
    }
}
