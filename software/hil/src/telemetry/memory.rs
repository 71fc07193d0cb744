//! In-memory telemetry target.

use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::{ControllerRecord, TelemetryEvent, TelemetrySink, TickRecord};
use crate::session::SessionConfig;

/// Cloneable read handle for the records collected by a [`MemorySink`].
///
/// Records become visible when the sink flushes, which the writer thread
/// does periodically and at the end of every session.
#[derive(Clone, Default)]
pub struct MemoryHandle {
    ticks: Arc<RwLock<Vec<TickRecord>>>,
    controller: Arc<RwLock<Vec<ControllerRecord>>>,
}

impl MemoryHandle {
    /// Copy of the plant tick records published so far.
    pub fn ticks(&self) -> Vec<TickRecord> {
        self.ticks.read().map(|v| v.clone()).unwrap_or_default()
    }

    /// Copy of the controller cycle records published so far.
    pub fn controller_cycles(&self) -> Vec<ControllerRecord> {
        self.controller.read().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn last_tick(&self) -> Option<TickRecord> {
        self.ticks.read().ok().and_then(|v| v.last().cloned())
    }

    pub fn tick_count(&self) -> usize {
        self.ticks.read().map(|v| v.len()).unwrap_or(0)
    }

    fn clear(&self) -> Result<(), String> {
        self.ticks
            .write()
            .map_err(|_| "Tick record lock poisoned".to_string())?
            .clear();
        self.controller
            .write()
            .map_err(|_| "Controller record lock poisoned".to_string())?
            .clear();
        Ok(())
    }
}

/// Collects records in memory, cleared at the start of each session.
///
/// Records are staged locally and only moved behind the shared locks
/// on flush, so readers never contend with every single record.
#[derive(Serialize, Deserialize, Default)]
pub struct MemorySink {
    #[serde(skip)]
    handle: MemoryHandle,
    #[serde(skip)]
    staged_ticks: Vec<TickRecord>,
    #[serde(skip)]
    staged_controller: Vec<ControllerRecord>,
}

impl MemorySink {
    pub fn new() -> (Self, MemoryHandle) {
        let sink = Self::default();
        let handle = sink.handle.clone();
        (sink, handle)
    }

    pub fn handle(&self) -> MemoryHandle {
        self.handle.clone()
    }
}

#[typetag::serde]
impl TelemetrySink for MemorySink {
    fn init(&mut self, _cfg: &SessionConfig) -> Result<(), String> {
        self.staged_ticks.clear();
        self.staged_controller.clear();
        self.handle.clear()
    }

    fn consume(&mut self, _time: SystemTime, event: &TelemetryEvent) -> Result<(), String> {
        match event {
            TelemetryEvent::Tick(t) => self.staged_ticks.push(t.clone()),
            TelemetryEvent::Controller(c) => self.staged_controller.push(c.clone()),
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), String> {
        if !self.staged_ticks.is_empty() {
            self.handle
                .ticks
                .write()
                .map_err(|_| "Tick record lock poisoned".to_string())?
                .append(&mut self.staged_ticks);
        }
        if !self.staged_controller.is_empty() {
            self.handle
                .controller
                .write()
                .map_err(|_| "Controller record lock poisoned".to_string())?
                .append(&mut self.staged_controller);
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), String> {
        self.flush()
    }
}
