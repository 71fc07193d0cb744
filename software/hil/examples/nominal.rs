//! Regulate a simulated point mass to the origin with a state feedback law,
//! with plant and controller on two threads of this process.
//!
//! Demonstrated here:
//!   * Setting tick rate, command deadline and (m,k) budget
//!   * Writing telemetry to CSV and to memory at the same time
//!   * Serializing a session configuration
//!   * Reading the session report

use std::time::Duration;

use hil::{
    CsvSink, DoubleIntegrator, MemorySink, Session, SessionConfig, StateFeedback, Termination,
};

use tracing::info;

fn main() {
    // Start building up session settings
    let mut cfg = SessionConfig::default();
    cfg.op_name = "nominal_example".to_string();

    // 100 Hz plant with a 5 ms round-trip budget, allowing 1 miss in 100
    let rate_hz = 100.0;
    cfg.tick_period_ns = (1e9_f64 / rate_hz).ceil() as u32;
    cfg.command_deadline_ns = 5_000_000;
    (cfg.m, cfg.k) = (1, 100);

    // Bound the actuator and the position
    cfg.actuator_bound = 2.0;
    cfg.state_bounds = vec![1.0];

    // End after a set number of ticks, or a timeout as a backstop
    cfg.termination_criteria = vec![
        Termination::Cycles(1000),
        Termination::Timeout(Duration::from_secs(15)),
    ];

    // Serialize and deserialize the config (for demonstration purposes)
    {
        let serialized = serde_json::to_string_pretty(&cfg).unwrap();
        let _: SessionConfig = serde_json::from_str(&serialized).unwrap();
    }

    // Plant starts displaced from the origin
    let plant = DoubleIntegrator { mass: 1.0 };
    let law = StateFeedback::new(vec![4.0, 4.0]);
    let mut session = Session::new(cfg, plant, vec![0.5, 0.0], law);

    // Write to CSV and keep a copy in memory
    let (memory, handle) = MemorySink::new();
    session.add_sink(Box::new(CsvSink::new()));
    session.add_sink(Box::new(memory));

    // Run until done
    let report = session.run().expect("Session failed to run");
    info!("Session report: {report:?}");

    // Look at how it went
    if let Some(last) = handle.last_tick() {
        info!(
            "Final state after {} ticks: {:?} ({})",
            last.sequence, last.state, last.safety_status
        );
    }
    let misses: usize = handle.ticks().iter().map(|t| t.deadline_misses()).sum();
    info!("{misses} commands arrived after the deadline");
}
