//! Bounded record queue and the thread that drains it into the sinks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::{debug, error, warn};

use super::{ControllerRecord, TelemetryEvent, TelemetrySink, TickRecord};
use crate::error::SessionError;
use crate::session::SessionConfig;

/// Longest the writer waits before checking for shutdown.
const STOP_POLL: Duration = Duration::from_millis(10);

/// Producer side of the telemetry queue.
///
/// Sending never blocks. When the queue is full the oldest queued record
/// is discarded to make room and the drop counter is incremented.
#[derive(Clone)]
pub struct TelemetrySender {
    tx: Sender<TelemetryEvent>,

    // Kept so a producer can evict from the front of the queue
    rx: Receiver<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
}

impl TelemetrySender {
    pub fn send(&self, mut event: TelemetryEvent) {
        for _ in 0..4 {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(e)) => {
                    if self.rx.try_recv().is_ok() {
                        self.count_drop();
                    }
                    event = e;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        // Lost the race against other producers; shed the new record instead
        self.count_drop();
    }

    pub fn tick(&self, record: TickRecord) {
        self.send(TelemetryEvent::Tick(record));
    }

    pub fn controller(&self, record: ControllerRecord) {
        self.send(TelemetryEvent::Controller(record));
    }

    /// Records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn count_drop(&self) {
        let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if n.is_power_of_two() {
            warn!("Telemetry queue full; {n} records dropped so far");
        }
    }
}

/// Owns the telemetry writer thread.
///
/// Sinks are flushed every `telemetry_flush_interval` and unconditionally
/// at shutdown, after everything still queued has been written.
pub struct TelemetryLogger {
    sender: TelemetrySender,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Vec<Box<dyn TelemetrySink>>>>,
}

impl TelemetryLogger {
    /// Initialize the sinks and start the writer thread.
    pub fn start(
        mut sinks: Vec<Box<dyn TelemetrySink>>,
        cfg: &SessionConfig,
    ) -> Result<Self, SessionError> {
        for sink in sinks.iter_mut() {
            sink.init(cfg).map_err(SessionError::Telemetry)?;
        }

        let (tx, rx) = bounded(cfg.telemetry_capacity.max(1));
        let sender = TelemetrySender {
            tx,
            rx: rx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };

        let stop = Arc::new(AtomicBool::new(false));
        let flush_interval = cfg.telemetry_flush_interval;
        let thread = {
            let stop = stop.clone();
            Builder::new()
                .name("hil-telemetry".to_string())
                .spawn(move || write_loop(rx, stop, sinks, flush_interval))?
        };

        Ok(Self {
            sender,
            stop,
            thread: Some(thread),
        })
    }

    /// A producer handle for one of the control loops.
    pub fn sender(&self) -> TelemetrySender {
        self.sender.clone()
    }

    pub fn dropped(&self) -> u64 {
        self.sender.dropped()
    }

    /// Write out everything queued, flush and terminate the sinks,
    /// and hand them back for reuse.
    pub fn shutdown(&mut self) -> Result<Vec<Box<dyn TelemetrySink>>, SessionError> {
        self.stop.store(true, Ordering::Relaxed);
        match self.thread.take() {
            Some(h) => h
                .join()
                .map_err(|_| SessionError::ThreadPanicked("telemetry".to_string())),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for TelemetryLogger {
    /// Make sure queued records reach the sinks on every exit path.
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.shutdown();
        }
    }
}

fn write_loop(
    rx: Receiver<TelemetryEvent>,
    stop: Arc<AtomicBool>,
    mut sinks: Vec<Box<dyn TelemetrySink>>,
    flush_interval: Duration,
) -> Vec<Box<dyn TelemetrySink>> {
    let mut last_flush = Instant::now();
    let wait = flush_interval.min(STOP_POLL).max(Duration::from_millis(1));

    loop {
        let stopping = stop.load(Ordering::Relaxed);
        if stopping {
            while let Ok(event) = rx.try_recv() {
                dispatch(&mut sinks, &event);
            }
            break;
        }

        match rx.recv_timeout(wait) {
            Ok(event) => dispatch(&mut sinks, &event),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_flush.elapsed() >= flush_interval {
            for sink in sinks.iter_mut() {
                if let Err(e) = sink.flush() {
                    warn!("Telemetry sink flush failed: {e}");
                }
            }
            last_flush = Instant::now();
        }
    }

    for sink in sinks.iter_mut() {
        if let Err(e) = sink.terminate() {
            error!("Telemetry sink failed to terminate cleanly: {e}");
        }
    }
    debug!("Telemetry writer finished");
    sinks
}

fn dispatch(sinks: &mut [Box<dyn TelemetrySink>], event: &TelemetryEvent) {
    let time = SystemTime::now();
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.consume(time, event) {
            warn!("Telemetry sink rejected a record: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::DeadlineStatus;
    use crate::safety::SafetyStatus;
    use crate::telemetry::MemorySink;

    fn record(sequence: u64) -> TickRecord {
        TickRecord {
            sequence,
            tick_time: sequence as f64 * 0.01,
            state: vec![0.0, 0.0],
            applied_command: 0.0,
            held_ticks: 0,
            deadlines: Vec::new(),
            deadline_status: DeadlineStatus::Nominal,
            window_miss_count: 0,
            safety_status: SafetyStatus::Nominal,
            active_faults: Vec::new(),
        }
    }

    fn cfg(capacity: usize) -> SessionConfig {
        SessionConfig {
            telemetry_capacity: capacity,
            ..Default::default()
        }
    }

    #[test]
    fn full_queue_drops_oldest() {
        // No writer thread: exercise the queue alone
        let (tx, rx) = bounded(3);
        let sender = TelemetrySender {
            tx,
            rx: rx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        for i in 0..5 {
            sender.tick(record(i));
        }
        assert_eq!(sender.dropped(), 2);

        let kept: Vec<u64> = rx
            .try_iter()
            .map(|e| match e {
                TelemetryEvent::Tick(t) => t.sequence,
                TelemetryEvent::Controller(c) => c.cycle_index,
            })
            .collect();
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[test]
    fn shutdown_writes_everything_queued() {
        let (sink, handle) = MemorySink::new();
        let mut logger = TelemetryLogger::start(vec![Box::new(sink)], &cfg(1024)).unwrap();
        let sender = logger.sender();
        for i in 0..100 {
            sender.tick(record(i));
        }
        let sinks = logger.shutdown().unwrap();
        assert_eq!(sinks.len(), 1);
        assert_eq!(logger.dropped(), 0);

        let ticks = handle.ticks();
        assert_eq!(ticks.len(), 100);
        assert_eq!(ticks.last().map(|t| t.sequence), Some(99));
    }

    #[test]
    fn records_are_visible_before_shutdown() {
        let cfg = SessionConfig {
            telemetry_flush_interval: Duration::from_millis(20),
            ..cfg(1024)
        };
        let (sink, handle) = MemorySink::new();
        let mut logger = TelemetryLogger::start(vec![Box::new(sink)], &cfg).unwrap();
        let sender = logger.sender();
        for i in 0..10 {
            sender.tick(record(i));
        }

        // Wait on the writer's own periodic flush
        let give_up = Instant::now() + Duration::from_secs(2);
        while handle.tick_count() < 10 && Instant::now() < give_up {
            std::thread::sleep(Duration::from_millis(5));
        }
        let ticks = handle.ticks();
        assert_eq!(ticks.len(), 10);
        assert_eq!(ticks.last().map(|t| t.sequence), Some(9));

        logger.shutdown().unwrap();
        assert_eq!(handle.tick_count(), 10);
    }

    #[test]
    fn drop_flushes_sinks() {
        let (sink, handle) = MemorySink::new();
        {
            let logger = TelemetryLogger::start(vec![Box::new(sink)], &cfg(16)).unwrap();
            logger.sender().tick(record(7));
        }
        assert_eq!(handle.last_tick().map(|t| t.sequence), Some(7));
    }
}
