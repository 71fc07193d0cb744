//! Plant server, controller client and safety layer for running a control law
//! against a simulated plant over a real link, with no hardware in the loop.

pub mod client;
pub mod clock;
pub mod deadline;
pub mod dynamics;
pub mod error;
pub mod fault;
pub mod logging;
pub mod plant;
pub mod safety;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use client::{ControllerClient, ControllerReport};
pub use clock::{Clock, ManualClock, SessionClock};
pub use deadline::{DeadlineRecord, DeadlineStatus, DeadlineTracker, MkWindow};
pub use dynamics::{ControlLaw, DoubleIntegrator, Plant, StateFeedback};
pub use error::{ComputeError, SessionError, TransportError};
pub use fault::{FaultEvent, FaultInjector, FaultKind, FaultTarget};
pub use plant::{IntakeStats, PlantServer, TickReport};
pub use safety::{
    EmergencyReason, SafetyMonitor, SafetySignals, SafetyStatus, SharedSafetyStatus,
};
pub use session::{
    Link, Session, SessionConfig, SessionHandle, SessionOutcome, SessionReport, Termination,
};
pub use telemetry::{
    ControllerRecord, CsvSink, MemoryHandle, MemorySink, TelemetryEvent, TelemetryLogger,
    TelemetrySender, TelemetrySink, TickRecord,
};
pub use transport::{TcpTransport, ThreadChannelTransport, Transport};

pub use hil_shared::{
    CommandFrame, Frame, MAX_PAYLOAD_VALUES, MalformedFrame, PLANT_PORT, StateFrame,
};
