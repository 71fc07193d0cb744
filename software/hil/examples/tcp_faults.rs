//! Run a plant server and a controller client over loopback TCP as two
//! independent loops, with a scheduled burst of dropped commands.
//!
//! The session API builds this same arrangement internally; here the
//! pieces are put together by hand, the way a plant and a controller
//! running in separate processes would be.
//!
//! Demonstrated here:
//!   * Standing up the plant server and controller client directly
//!   * Scheduling link faults
//!   * A closure as the control law
//!   * Hold-last-value riding through a short outage, then stopping on a long one

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use hil::{
    ComputeError, ControllerClient, DoubleIntegrator, FaultEvent, FaultKind, FaultTarget,
    PlantServer, SessionClock, SessionConfig, SharedSafetyStatus, TcpTransport, Termination,
    Transport,
};

use tracing::info;

fn run(drop_ticks: u32) {
    let mut cfg = SessionConfig::default();
    cfg.op_name = format!("tcp_faults_{drop_ticks}");
    let dt = cfg.tick_period();

    // Lose commands for `drop_ticks` tick periods about half a second in,
    // then bias the sensor for a while
    cfg.fault_schedule = vec![
        FaultEvent::new(
            FaultKind::Drop,
            49.5 * dt,
            drop_ticks as f64 * dt,
            FaultTarget::Command,
        ),
        FaultEvent::new(FaultKind::Bias(0.01), 1.0, 0.5, FaultTarget::State),
    ];
    cfg.termination_criteria = vec![Termination::Cycles(200)];

    // Plant side
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("Failed to bind");
    let addr = listener.local_addr().unwrap();
    let shared = SharedSafetyStatus::new();
    let mut plant = PlantServer::new(Box::new(DoubleIntegrator::default()), vec![0.2, 0.0], &cfg)
        .with_shared_status(shared.clone());

    // Controller side, on its own thread with its own socket
    let clock = SessionClock::new();
    let stop = Arc::new(AtomicBool::new(false));
    let controller = {
        let law = |x: &[f64]| -> Result<f64, ComputeError> { Ok(-2.0 * x[0] - 3.0 * x[1]) };
        let mut client = ControllerClient::new(Box::new(law), &cfg).with_shared_status(shared);
        let stop = stop.clone();
        let timeout = cfg.connect_timeout;
        thread::spawn(move || {
            let mut link = TcpTransport::connect(addr, timeout).expect("Failed to connect");
            let report = client.run(&mut link, &clock, &stop);
            link.close();
            report
        })
    };

    let mut link = TcpTransport::accept(&listener, cfg.connect_timeout).expect("No controller");
    let outcome = plant
        .run(&mut link, &clock, &AtomicBool::new(false), &cfg.termination_criteria)
        .expect("Plant loop failed");
    stop.store(true, Ordering::Relaxed);
    let report = controller.join().unwrap();
    link.close();

    info!(
        "{drop_ticks} dropped commands: {outcome:?} after {} ticks, reason {:?}",
        plant.ticks(),
        plant.emergency_reason()
    );
    info!("Controller: {report:?}");
    info!("Plant intake: {:?}", plant.intake_stats());
}

fn main() {
    tracing_subscriber::fmt().init();

    // Within the hold limit; rides through
    run(3);

    // One past it; stops on the fourth
    run(4);
}
