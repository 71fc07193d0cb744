//! Configuration shared by every part of a session.

use std::default::Default;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fault::FaultEvent;

/// Criteria for ending a session without an emergency stop.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum Termination {
    /// End after this many plant ticks
    Cycles(u64),

    /// End after this much time from the first tick
    Timeout(Duration),
}

impl Termination {
    /// Whether this criterion is met after `ticks` ticks and `elapsed` seconds.
    pub fn reached(&self, ticks: u64, elapsed: f64) -> bool {
        match self {
            Termination::Cycles(n) => ticks >= *n,
            Termination::Timeout(d) => elapsed >= d.as_secs_f64(),
        }
    }
}

/// Timing, safety limits, fault schedule and output locations of a session.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Plant tick period in nanoseconds
    pub tick_period_ns: u32,

    /// Time allowed from emitting a state frame to receiving the command
    /// that answers it, in nanoseconds
    pub command_deadline_ns: u32,

    /// At most `m` deadline misses in any `k` consecutive cycles
    pub m: u32,
    pub k: u32,

    /// Number of consecutive ticks the plant may reuse its last command
    /// before stopping
    pub hold_last_value_limit: u32,

    /// Number of ticks the plant waits for a first command before stopping
    pub startup_grace_ticks: u32,

    /// Largest magnitude of actuator command that is applied unclamped
    pub actuator_bound: f64,

    /// Largest magnitude allowed for each state component.
    /// Components without an entry are unbounded.
    pub state_bounds: Vec<f64>,

    pub fault_schedule: Vec<FaultEvent>,

    /// Seed for randomized fault magnitudes
    pub fault_seed: u64,

    pub termination_criteria: Vec<Termination>,

    /// Capacity of the telemetry queue in records
    pub telemetry_capacity: usize,
    pub telemetry_flush_interval: Duration,

    /// How long to wait for the controller to connect over TCP
    pub connect_timeout: Duration,

    /// A name for this session, used for the names of output files
    pub op_name: String,

    /// Directory for output files
    pub op_dir: PathBuf,

    /// Whether `Session::run` sets up terminal and file logging
    pub enable_file_logging: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        // Use current time with seconds as op name and use working directory as op dir,
        // replacing characters in the name that would be invalid on Windows.
        let op_name = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .replace(":", "");
        Self {
            tick_period_ns: 10_000_000,
            command_deadline_ns: 5_000_000,
            m: 1,
            k: 100,
            hold_last_value_limit: 3,
            startup_grace_ticks: 100,
            actuator_bound: 1.0,
            state_bounds: Vec::new(),
            fault_schedule: Vec::new(),
            fault_seed: 0,
            termination_criteria: Vec::new(),
            telemetry_capacity: 1024,
            telemetry_flush_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            op_name,
            op_dir: std::fs::canonicalize("./").unwrap_or_default(),
            enable_file_logging: true,
        }
    }
}

impl SessionConfig {
    /// Tick period [s]
    pub fn tick_period(&self) -> f64 {
        self.tick_period_ns as f64 / 1e9
    }

    /// Command deadline [s]
    pub fn command_deadline(&self) -> f64 {
        self.command_deadline_ns as f64 / 1e9
    }

    /// Check for settings that cannot run.
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_period_ns == 0 {
            return Err("tick period must be nonzero".to_string());
        }
        if self.command_deadline_ns == 0 {
            return Err("command deadline must be nonzero".to_string());
        }
        if self.k == 0 {
            return Err("(m,k) window length k must be nonzero".to_string());
        }
        if !(self.actuator_bound.is_finite() && self.actuator_bound >= 0.0) {
            return Err(format!("actuator bound {} is invalid", self.actuator_bound));
        }
        if let Some((i, b)) = self
            .state_bounds
            .iter()
            .enumerate()
            .find(|(_, b)| !(b.is_finite() && **b >= 0.0))
        {
            return Err(format!("state bound {i} ({b}) is invalid"));
        }
        for event in &self.fault_schedule {
            event.validate()?;
        }
        if self.telemetry_capacity == 0 {
            return Err("telemetry capacity must be nonzero".to_string());
        }
        if self.telemetry_flush_interval.is_zero() {
            return Err("telemetry flush interval must be nonzero".to_string());
        }
        if self.op_name.is_empty() {
            return Err("op name must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultKind, FaultTarget};

    #[test]
    fn defaults_are_valid() {
        let cfg = SessionConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.tick_period(), 0.01);
        assert_eq!(cfg.command_deadline(), 0.005);
        assert!(!cfg.op_name.contains(':'));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let broken: [fn(&mut SessionConfig); 5] = [
            |c| c.k = 0,
            |c| c.tick_period_ns = 0,
            |c| c.actuator_bound = f64::NAN,
            |c| c.state_bounds = vec![1.0, -1.0],
            |c| {
                c.fault_schedule = vec![FaultEvent::new(
                    FaultKind::Drop,
                    f64::INFINITY,
                    1.0,
                    FaultTarget::Command,
                )]
            },
        ];
        for f in broken {
            let mut cfg = SessionConfig::default();
            f(&mut cfg);
            assert!(cfg.validate().is_err(), "{cfg:?}");
        }
    }

    #[test]
    fn config_serializes() {
        let mut cfg = SessionConfig::default();
        cfg.termination_criteria = vec![
            Termination::Cycles(10),
            Termination::Timeout(Duration::from_millis(250)),
        ];
        let s = serde_json::to_string(&cfg).unwrap();
        let back: SessionConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(back.termination_criteria, cfg.termination_criteria);
        assert_eq!(back.op_name, cfg.op_name);
    }

    #[test]
    fn termination_criteria() {
        assert!(Termination::Cycles(3).reached(3, 0.0));
        assert!(!Termination::Cycles(3).reached(2, 100.0));
        assert!(Termination::Timeout(Duration::from_millis(500)).reached(0, 0.5));
    }
}
