//! Telemetry capture for both control loops.
//!
//! The loops hand records to a [`TelemetrySender`], which never blocks.
//! A writer thread owned by the [`TelemetryLogger`] passes them on to
//! each configured [`TelemetrySink`].

mod csv;
mod memory;
mod writer;

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deadline::{DeadlineRecord, DeadlineStatus};
use crate::safety::SafetyStatus;
use crate::session::SessionConfig;

pub use csv::CsvSink;
pub use memory::{MemoryHandle, MemorySink};
pub use writer::{TelemetryLogger, TelemetrySender};

/// One plant tick.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TickRecord {
    /// Sequence number of the state frame emitted on this tick
    pub sequence: u64,
    pub tick_time: f64,

    /// State after integrating this tick
    pub state: Vec<f64>,

    /// Command actually applied, after clamping
    pub applied_command: f64,

    /// Consecutive ticks without a fresh command
    pub held_ticks: u32,

    /// Round-trip timing of every state frame first answered on this tick
    pub deadlines: Vec<DeadlineRecord>,

    /// Worst classification among `deadlines`
    pub deadline_status: DeadlineStatus,
    pub window_miss_count: usize,

    pub safety_status: SafetyStatus,
    pub active_faults: Vec<String>,
}

impl TickRecord {
    /// Number of late answers delivered on this tick.
    pub fn deadline_misses(&self) -> usize {
        self.deadlines.iter().filter(|d| d.missed).count()
    }
}

/// One controller compute cycle.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ControllerRecord {
    pub cycle_index: u64,

    /// Sequence of the state frame answered
    pub state_sequence: u64,
    pub receipt_time: f64,
    pub completion_time: f64,
    pub command: f64,

    /// The control law failed and the last safe command was sent instead
    pub compute_failed: bool,

    pub missed: bool,
    pub window_miss_count: usize,

    /// Median of recent compute times [ns]
    pub filtered_compute_time_ns: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum TelemetryEvent {
    Tick(TickRecord),
    Controller(ControllerRecord),
}

/// A telemetry target that receives records on the writer thread.
#[typetag::serde(tag = "type")]
pub trait TelemetrySink: Send + Sync {
    /// Set up the sink at the start of a session
    fn init(&mut self, cfg: &SessionConfig) -> Result<(), String>;

    /// Take one record
    fn consume(&mut self, time: SystemTime, event: &TelemetryEvent) -> Result<(), String>;

    /// Push buffered records to their destination
    fn flush(&mut self) -> Result<(), String>;

    /// Flush and release resources, resetting for the next session
    fn terminate(&mut self) -> Result<(), String>;
}

/// Fixed-width ISO-8601 UTC timestamp with nanoseconds and Z-suffix
pub fn fmt_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
