//! A plant server and a controller client run together as one session.
//!
//! The session owns all mutable state of a run. The plant loop runs on the
//! calling thread and the controller loop on its own thread, and the two
//! only talk through the link. On every exit path the controller is stopped,
//! telemetry is flushed and only then is the link closed.

mod context;
mod handle;

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{Builder, JoinHandle};

use hil_shared::MAX_PAYLOAD_VALUES;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::client::{ControllerClient, ControllerReport};
use crate::clock::SessionClock;
use crate::dynamics::{ControlLaw, Plant};
use crate::error::{SessionError, TransportError};
use crate::logging::{self, SessionLog};
use crate::plant::PlantServer;
use crate::safety::{EmergencyReason, SafetyStatus, SharedSafetyStatus};
use crate::telemetry::{TelemetryLogger, TelemetrySink};
use crate::transport::{TcpTransport, ThreadChannelTransport, Transport};

pub use context::{SessionConfig, Termination};
pub use handle::SessionHandle;

/// Frames buffered each way on an in-process link.
const THREAD_LINK_CAPACITY: usize = 16;

/// How a session ended.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A termination criterion was met
    Completed,

    /// Stopped from outside
    Stopped,

    /// The safety monitor stopped the plant
    EmergencyStop,
}

/// Summary of a finished session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub ticks: u64,
    pub final_status: SafetyStatus,
    pub emergency_reason: Option<EmergencyReason>,

    /// Commands that arrived later than the deadline after their state frame
    pub deadline_misses: u64,
    pub deadline_breaches: u64,

    pub stale_commands: u64,

    /// Malformed frames seen on either end
    pub malformed_frames: u64,

    /// Frames lost to drop faults on either end
    pub fault_dropped: u64,

    /// State frames the link could not take without blocking
    pub link_dropped: u64,

    pub telemetry_dropped: u64,
    pub controller: ControllerReport,
}

/// Medium connecting the plant and the controller.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub enum Link {
    /// Bounded channels between two threads of this process
    #[default]
    ThreadChannel,

    /// TCP over loopback or a network; the plant listens on `addr`
    Tcp { addr: String },
}

impl Link {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Link::Tcp { addr: addr.into() }
    }
}

/// One plant and one controller with their shared configuration.
pub struct Session {
    cfg: SessionConfig,
    plant: Box<dyn Plant>,
    initial_state: Vec<f64>,
    law: Box<dyn ControlLaw>,
    link: Link,
    sinks: Vec<Box<dyn TelemetrySink>>,
}

impl Session {
    pub fn new<P, L>(cfg: SessionConfig, plant: P, initial_state: Vec<f64>, law: L) -> Self
    where
        P: Plant + 'static,
        L: ControlLaw + 'static,
    {
        Self {
            cfg,
            plant: Box::new(plant),
            initial_state,
            law: Box::new(law),
            link: Link::default(),
            sinks: Vec::new(),
        }
    }

    pub fn with_link(mut self, link: Link) -> Self {
        self.link = link;
        self
    }

    /// Register a telemetry target
    pub fn add_sink(&mut self, sink: Box<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }

    pub fn cfg(&self) -> &SessionConfig {
        &self.cfg
    }

    /// Run to completion on this thread.
    pub fn run(self) -> Result<SessionReport, SessionError> {
        self.run_until(Arc::new(AtomicBool::new(false)))
    }

    /// Run on a background thread.
    pub fn spawn(self) -> Result<SessionHandle, SessionError> {
        let stop = Arc::new(AtomicBool::new(false));
        let join = {
            let stop = stop.clone();
            Builder::new()
                .name("hil-session".to_string())
                .spawn(move || self.run_until(stop))?
        };
        Ok(SessionHandle::new(stop, join))
    }

    fn run_until(self, stop: Arc<AtomicBool>) -> Result<SessionReport, SessionError> {
        let Session {
            cfg,
            plant,
            initial_state,
            law,
            link,
            sinks,
        } = self;

        cfg.validate().map_err(SessionError::Config)?;
        if initial_state.len() > MAX_PAYLOAD_VALUES {
            return Err(SessionError::Config(format!(
                "initial state has {} components; a state frame carries at most {}",
                initial_state.len(),
                MAX_PAYLOAD_VALUES
            )));
        }

        let log = if cfg.enable_file_logging {
            match logging::init_logging(&cfg.op_dir, &cfg.op_name) {
                Ok(log) => {
                    info!("Logging to {:?}", log.path());
                    Some(log)
                }
                Err(e) => {
                    warn!("File logging unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };
        info!(
            "Starting session {} with {:?} link, {:.3} ms ticks, {:.3} ms deadline, \
             (m,k) = ({}, {})",
            cfg.op_name,
            link,
            cfg.tick_period() * 1e3,
            cfg.command_deadline() * 1e3,
            cfg.m,
            cfg.k
        );

        let mut teardown = Teardown {
            controller_stop: Arc::new(AtomicBool::new(false)),
            telemetry: TelemetryLogger::start(sinks, &cfg)?,
            link: None,
            log,
        };
        let clock = SessionClock::new();
        let shared = SharedSafetyStatus::new();

        let mut plant = PlantServer::new(plant, initial_state, &cfg)
            .with_shared_status(shared.clone())
            .with_telemetry(teardown.telemetry.sender());
        let client = ControllerClient::new(law, &cfg)
            .with_shared_status(shared)
            .with_telemetry(teardown.telemetry.sender());

        // Set up the link and start the controller on the other end of it
        let controller = match &link {
            Link::ThreadChannel => {
                let (plant_end, controller_end) =
                    ThreadChannelTransport::pair(THREAD_LINK_CAPACITY);
                teardown.link = Some(Box::new(plant_end));
                spawn_controller(client, clock, teardown.controller_stop.clone(), move || {
                    Ok(Box::new(controller_end) as Box<dyn Transport>)
                })?
            }
            Link::Tcp { addr } => {
                let listener = TcpListener::bind(addr.as_str())?;
                let local = listener.local_addr()?;
                info!("Plant listening on {local}");
                let connect_timeout = cfg.connect_timeout;
                let connect = move || -> Result<Box<dyn Transport>, TransportError> {
                    Ok(Box::new(TcpTransport::connect(local, connect_timeout)?))
                };
                let controller =
                    spawn_controller(client, clock, teardown.controller_stop.clone(), connect)?;
                let plant_end = TcpTransport::accept(&listener, connect_timeout)?;
                teardown.link = Some(Box::new(plant_end));
                controller
            }
        };

        let plant_link = teardown
            .link
            .as_mut()
            .ok_or_else(|| SessionError::Config("plant link was not opened".to_string()))?;
        let plant_result =
            plant.run(plant_link.as_mut(), &clock, &stop, &cfg.termination_criteria);
        let link_dropped = plant_link.dropped();

        // Wind down in order: controller, telemetry, links, log file
        teardown.controller_stop.store(true, Ordering::Relaxed);
        let joined = controller.join();
        let telemetry_dropped = teardown.telemetry.dropped();
        let flushed = teardown.telemetry.shutdown();
        let log = teardown.log.take();
        drop(teardown);

        let (controller_result, controller_report, controller_link) =
            joined.map_err(|_| SessionError::ThreadPanicked("controller".to_string()))?;
        if let Some(mut l) = controller_link {
            l.close();
        }
        flushed?;
        let outcome = plant_result?;
        if let Err(e) = controller_result {
            error!("Controller loop failed: {e}");
            return Err(e.into());
        }

        let intake = plant.intake_stats();
        let tracker = plant.deadline_tracker();
        let report = SessionReport {
            outcome,
            ticks: plant.ticks(),
            final_status: plant.status(),
            emergency_reason: plant.emergency_reason(),
            deadline_misses: tracker.total_misses(),
            deadline_breaches: tracker.breaches(),
            stale_commands: intake.stale,
            malformed_frames: intake.malformed + controller_report.malformed_frames,
            fault_dropped: intake.fault_dropped + controller_report.fault_dropped,
            link_dropped,
            telemetry_dropped,
            controller: controller_report,
        };
        info!(
            "Session {} ended {:?} after {} ticks with status {}",
            cfg.op_name, report.outcome, report.ticks, report.final_status
        );
        drop(log);
        Ok(report)
    }
}

type ControllerExit = (
    Result<ControllerReport, TransportError>,
    ControllerReport,
    Option<Box<dyn Transport>>,
);

/// Start the controller loop on its own thread. The thread opens its end of
/// the link with `connect` and hands it back when done.
fn spawn_controller<F>(
    mut client: ControllerClient,
    clock: SessionClock,
    stop: Arc<AtomicBool>,
    connect: F,
) -> Result<JoinHandle<ControllerExit>, SessionError>
where
    F: FnOnce() -> Result<Box<dyn Transport>, TransportError> + Send + 'static,
{
    let handle = Builder::new()
        .name("hil-controller".to_string())
        .spawn(move || {
            let mut transport = match connect() {
                Ok(t) => t,
                Err(e) => return (Err(e), client.report(), None),
            };
            let result = client.run(transport.as_mut(), &clock, &stop);
            (result, client.report(), Some(transport))
        })?;
    Ok(handle)
}

/// Resources that must be released in order on every exit path,
/// including unwinding out of a panicking plant model.
struct Teardown {
    controller_stop: Arc<AtomicBool>,
    telemetry: TelemetryLogger,
    link: Option<Box<dyn Transport>>,
    log: Option<SessionLog>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.controller_stop.store(true, Ordering::Relaxed);
        if let Err(e) = self.telemetry.shutdown() {
            error!("Telemetry shutdown failed: {e}");
        }
        if let Some(link) = self.link.as_mut() {
            link.close();
        }
        drop(self.log.take());
    }
}
