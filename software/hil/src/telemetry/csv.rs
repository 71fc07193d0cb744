//! Plain-text CSV telemetry target.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ControllerRecord, TelemetryEvent, TelemetrySink, TickRecord, fmt_time};
use crate::session::SessionConfig;

const CONTROLLER_HEADER: &str = "time,cycle_index,state_sequence,receipt_time,completion_time,\
command,compute_failed,missed,window_miss_count,filtered_compute_time_ns\n";

/// Writes one line per plant tick to `<op_dir>/<op_name>.csv`
/// and one line per controller cycle to `<op_dir>/<op_name>_controller.csv`.
///
/// The state vector is spread over `state_0, state_1, ...` columns sized from
/// the first tick. Active faults are joined with `;` in a single column.
#[derive(Serialize, Deserialize, Default)]
pub struct CsvSink {
    #[serde(skip)]
    ticks: Option<CsvFile>,

    #[serde(skip)]
    controller: Option<CsvFile>,

    #[serde(skip)]
    stringbuf: String,
}

struct CsvFile {
    path: PathBuf,
    writer: BufWriter<File>,
    has_header: bool,
}

impl CsvFile {
    fn create(path: PathBuf) -> Result<Self, String> {
        let file = File::create(&path).map_err(|e| format!("Failed to create {path:?}: {e}"))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            has_header: false,
        })
    }

    fn write(&mut self, s: &str) -> Result<(), String> {
        self.writer
            .write_all(s.as_bytes())
            .map_err(|e| format!("Failed to write {:?}: {e}", self.path))
    }

    fn flush(&mut self) -> Result<(), String> {
        self.writer
            .flush()
            .map_err(|e| format!("Failed to flush {:?}: {e}", self.path))
    }
}

impl CsvSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick_row(&mut self, time: SystemTime, t: &TickRecord) -> Result<(), String> {
        let file = self
            .ticks
            .as_mut()
            .ok_or_else(|| "CSV sink must be initialized before consuming data".to_string())?;

        let buf = &mut self.stringbuf;
        if !file.has_header {
            buf.clear();
            buf.push_str("time,sequence,tick_time");
            for i in 0..t.state.len() {
                buf.push_str(&format!(",state_{i}"));
            }
            buf.push_str(
                ",applied_command,held_ticks,deadline_misses,deadline_status,\
                 window_miss_count,safety_status,active_faults\n",
            );
            file.write(buf)?;
            file.has_header = true;
        }

        buf.clear();
        buf.push_str(&format!("{},{},{}", fmt_time(time), t.sequence, t.tick_time));
        for x in &t.state {
            buf.push_str(&format!(",{x}"));
        }
        buf.push_str(&format!(
            ",{},{},{},{},{},{},{}\n",
            t.applied_command,
            t.held_ticks,
            t.deadline_misses(),
            t.deadline_status.as_str(),
            t.window_miss_count,
            t.safety_status,
            t.active_faults.join(";"),
        ));
        file.write(buf)
    }

    fn controller_row(&mut self, time: SystemTime, c: &ControllerRecord) -> Result<(), String> {
        let file = self
            .controller
            .as_mut()
            .ok_or_else(|| "CSV sink must be initialized before consuming data".to_string())?;

        if !file.has_header {
            file.write(CONTROLLER_HEADER)?;
            file.has_header = true;
        }

        let buf = &mut self.stringbuf;
        buf.clear();
        buf.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            fmt_time(time),
            c.cycle_index,
            c.state_sequence,
            c.receipt_time,
            c.completion_time,
            c.command,
            c.compute_failed as u8,
            c.missed as u8,
            c.window_miss_count,
            c.filtered_compute_time_ns,
        ));
        file.write(buf)
    }
}

#[typetag::serde]
impl TelemetrySink for CsvSink {
    fn init(&mut self, cfg: &SessionConfig) -> Result<(), String> {
        // Close out anything left from a previous session
        self.terminate()?;

        fs::create_dir_all(&cfg.op_dir)
            .map_err(|e| format!("Failed to create output directory {:?}: {e}", cfg.op_dir))?;
        let ticks = CsvFile::create(cfg.op_dir.join(format!("{}.csv", cfg.op_name)))?;
        let controller =
            CsvFile::create(cfg.op_dir.join(format!("{}_controller.csv", cfg.op_name)))?;
        info!("Writing telemetry to {:?}", ticks.path);

        self.ticks = Some(ticks);
        self.controller = Some(controller);
        Ok(())
    }

    fn consume(&mut self, time: SystemTime, event: &TelemetryEvent) -> Result<(), String> {
        match event {
            TelemetryEvent::Tick(t) => self.tick_row(time, t),
            TelemetryEvent::Controller(c) => self.controller_row(time, c),
        }
    }

    fn flush(&mut self) -> Result<(), String> {
        for file in [&mut self.ticks, &mut self.controller].into_iter().flatten() {
            file.flush()?;
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), String> {
        self.flush()?;
        self.ticks = None;
        self.controller = None;
        Ok(())
    }
}
