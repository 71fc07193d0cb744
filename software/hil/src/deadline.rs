//! Weakly-hard deadline accounting.
//!
//! Each control cycle is classified as on time or missed, and the last `k`
//! classifications are kept in an (m,k) window. Any `k` consecutive cycles
//! may contain at most `m` misses; one more is a breach.

use serde::{Deserialize, Serialize};

/// Timing outcome of one control cycle. Never modified after creation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct DeadlineRecord {
    pub cycle_index: u64,
    pub scheduled_time: f64,
    pub actual_time: f64,
    pub missed: bool,
}

impl DeadlineRecord {
    pub fn latency(&self) -> f64 {
        self.actual_time - self.scheduled_time
    }
}

/// Classification of the latest cycle.
///
/// Ordered by severity, so the worst of several cycles is their `max`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeadlineStatus {
    /// On time
    #[default]
    Nominal,

    /// Missed, but not a new breach of the (m,k) constraint
    Warning,

    /// This cycle pushed the window past `m` misses
    EmergencyTriggered,
}

impl DeadlineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlineStatus::Nominal => "nominal",
            DeadlineStatus::Warning => "warning",
            DeadlineStatus::EmergencyTriggered => "emergency_triggered",
        }
    }
}

/// Ring buffer of the last `k` missed flags with a running miss count.
#[derive(Clone, Debug)]
pub struct MkWindow {
    flags: Vec<bool>,
    oldest: usize,
    len: usize,
    misses: usize,
}

impl MkWindow {
    pub fn new(k: usize) -> Self {
        assert!(k > 0, "(m,k) window needs k > 0");
        Self {
            flags: vec![false; k],
            oldest: 0,
            len: 0,
            misses: 0,
        }
    }

    /// Push the newest flag, evicting the oldest once the window is full.
    /// Returns the evicted flag, if any.
    pub fn push(&mut self, missed: bool) -> Option<bool> {
        let k = self.flags.len();
        let evicted = if self.len == k {
            let old = std::mem::replace(&mut self.flags[self.oldest], missed);
            self.oldest = (self.oldest + 1) % k;
            if old {
                self.misses -= 1;
            }
            Some(old)
        } else {
            self.flags[(self.oldest + self.len) % k] = missed;
            self.len += 1;
            None
        };

        if missed {
            self.misses += 1;
        }
        evicted
    }

    pub fn miss_count(&self) -> usize {
        self.misses
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn k(&self) -> usize {
        self.flags.len()
    }

    /// Flags from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        let k = self.flags.len();
        (0..self.len).map(move |i| self.flags[(self.oldest + i) % k])
    }
}

/// Per-cycle deadline classification with an (m,k)-firm breach detector.
#[derive(Clone, Debug)]
pub struct DeadlineTracker {
    deadline: f64,
    m: usize,
    window: MkWindow,

    next_cycle: u64,
    status: DeadlineStatus,

    /// Cycle whose miss caused the last reported breach, while it is still in the window
    breach_cycle: Option<u64>,

    total_misses: u64,
    breaches: u64,
}

impl DeadlineTracker {
    /// `deadline` in seconds; at most `m` misses are allowed in any `k` consecutive cycles.
    pub fn new(deadline: f64, m: u32, k: u32) -> Self {
        Self {
            deadline,
            m: m as usize,
            window: MkWindow::new(k as usize),
            next_cycle: 0,
            status: DeadlineStatus::Nominal,
            breach_cycle: None,
            total_misses: 0,
            breaches: 0,
        }
    }

    /// Classify one cycle and advance the window.
    ///
    /// A breach is reported once, on the cycle whose miss takes the window
    /// past `m`. Reporting re-arms after that cycle ages out of the window.
    pub fn record(
        &mut self,
        scheduled_time: f64,
        actual_time: f64,
    ) -> (DeadlineRecord, DeadlineStatus) {
        let cycle_index = self.next_cycle;
        self.next_cycle += 1;

        let missed = actual_time - scheduled_time > self.deadline;
        self.window.push(missed);

        if let Some(b) = self.breach_cycle {
            if cycle_index - b >= self.window.k() as u64 {
                self.breach_cycle = None;
            }
        }

        let status = if !missed {
            DeadlineStatus::Nominal
        } else {
            self.total_misses += 1;
            if self.window.miss_count() > self.m && self.breach_cycle.is_none() {
                self.breach_cycle = Some(cycle_index);
                self.breaches += 1;
                DeadlineStatus::EmergencyTriggered
            } else {
                DeadlineStatus::Warning
            }
        };
        self.status = status;

        let record = DeadlineRecord {
            cycle_index,
            scheduled_time,
            actual_time,
            missed,
        };
        (record, status)
    }

    /// Classification of the latest cycle.
    pub fn status(&self) -> DeadlineStatus {
        self.status
    }

    /// Whether the current window holds more than `m` misses.
    pub fn is_breached(&self) -> bool {
        self.window.miss_count() > self.m
    }

    pub fn window_miss_count(&self) -> usize {
        self.window.miss_count()
    }

    pub fn window(&self) -> &MkWindow {
        &self.window
    }

    pub fn deadline(&self) -> f64 {
        self.deadline
    }

    pub fn cycles(&self) -> u64 {
        self.next_cycle
    }

    pub fn total_misses(&self) -> u64 {
        self.total_misses
    }

    pub fn breaches(&self) -> u64 {
        self.breaches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run a tracker over cycles `0..n` with misses at the given cycles,
    /// returning the cycles that triggered.
    fn triggers(m: u32, k: u32, n: u64, misses: &[u64]) -> Vec<u64> {
        let mut tracker = DeadlineTracker::new(0.005, m, k);
        let mut out = Vec::new();
        for i in 0..n {
            let t0 = i as f64 * 0.01;
            let latency = if misses.contains(&i) { 0.007 } else { 0.003 };
            let (record, status) = tracker.record(t0, t0 + latency);
            assert_eq!(record.cycle_index, i);
            assert_eq!(record.missed, misses.contains(&i));
            if status == DeadlineStatus::EmergencyTriggered {
                out.push(i);
            }
        }
        out
    }

    #[test]
    fn window_evicts_oldest() {
        let mut w = MkWindow::new(3);
        assert_eq!(w.push(true), None);
        assert_eq!(w.push(false), None);
        assert_eq!(w.push(true), None);
        assert_eq!(w.miss_count(), 2);
        assert_eq!(w.push(false), Some(true));
        assert_eq!(w.miss_count(), 1);
        assert_eq!(w.iter().collect::<Vec<_>>(), vec![false, true, false]);
        assert_eq!(w.len(), 3);
    }

    #[test]
    fn second_miss_in_window_triggers_once() {
        assert_eq!(triggers(1, 100, 1000, &[10, 60]), vec![60]);
    }

    #[test]
    fn one_miss_per_window_never_triggers() {
        let misses: Vec<u64> = (0..10).map(|i| i * 100 + 37).collect();
        assert!(triggers(1, 100, 1000, &misses).is_empty());
    }

    #[test]
    fn rearms_after_breaching_miss_ages_out() {
        // 60 breaches; 110 is inside the same breach; once 60 leaves at 160
        // the miss at 160 (with 110 still in the window) is a new breach.
        assert_eq!(triggers(1, 100, 400, &[10, 60, 110, 160]), vec![60, 160]);
    }

    #[test]
    fn within_budget_miss_is_a_warning() {
        let mut tracker = DeadlineTracker::new(0.005, 2, 10);
        assert_eq!(tracker.record(0.0, 0.001).1, DeadlineStatus::Nominal);
        assert_eq!(tracker.record(0.01, 0.02).1, DeadlineStatus::Warning);
        assert_eq!(tracker.status(), DeadlineStatus::Warning);
        assert!(!tracker.is_breached());
        assert_eq!(tracker.window_miss_count(), 1);
        assert_eq!(tracker.total_misses(), 1);
    }

    #[test]
    fn deadline_boundary_is_not_a_miss() {
        let mut tracker = DeadlineTracker::new(0.25, 0, 4);
        let (record, status) = tracker.record(1.0, 1.25);
        assert!(!record.missed);
        assert_eq!(status, DeadlineStatus::Nominal);
    }
}
