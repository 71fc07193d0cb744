//! Deterministic plant/controller scenarios driven tick by tick on a manual clock.

use hil::{
    Clock, CommandFrame, ComputeError, ControllerClient, DeadlineStatus, DoubleIntegrator,
    EmergencyReason, FaultEvent, FaultKind, FaultTarget, ManualClock, PlantServer, SafetyStatus,
    SessionConfig, StateFeedback, TickReport,
};

const DT: f64 = 0.01;

/// Plant and controller joined by a link with a fixed one-way latency profile.
struct Bench {
    plant: PlantServer,
    client: ControllerClient,
    clock: ManualClock,
}

impl Bench {
    fn new(cfg: &SessionConfig) -> Self {
        Self {
            plant: PlantServer::new(Box::new(DoubleIntegrator::default()), vec![0.1, 0.0], cfg),
            client: ControllerClient::new(Box::new(StateFeedback::new(vec![2.0, 3.0])), cfg),
            clock: ManualClock::new(0.0),
        }
    }

    /// Tick `i` runs at `i * DT`. The command answering it is delivered
    /// `round_trip(i)` seconds after the tick.
    fn tick(&mut self, i: u64, round_trip: impl Fn(u64) -> f64) -> TickReport {
        let now = i as f64 * DT;
        self.clock.set(now);
        let report = self.plant.tick(now);
        if report.status == SafetyStatus::EmergencyStop {
            return report;
        }

        let bytes = report.frame.encode();
        if let Some((frame, _)) = self.client.admit(now, &bytes) {
            let cmd = self.client.respond(&frame, self.clock.now(), &self.clock);
            self.plant.receive(now + round_trip(i), cmd.encode());
        }
        report
    }
}

fn fixed(_: u64) -> f64 {
    0.003
}

fn command(sequence: u64, u: f64) -> Vec<u8> {
    CommandFrame {
        sequence,
        issued_time: 0.0,
        command: u,
    }
    .encode()
}

#[test]
fn nominal_run_has_no_misses() {
    let cfg = SessionConfig::default();
    let mut bench = Bench::new(&cfg);

    let mut last_sequence = 0;
    for i in 1..=1000 {
        let r = bench.tick(i, fixed);
        assert_eq!(r.status, SafetyStatus::Nominal, "tick {i}");
        assert!(r.deadlines.iter().all(|d| !d.missed), "tick {i}");
        assert!(r.frame.sequence > last_sequence);
        last_sequence = r.frame.sequence;
    }

    assert_eq!(bench.plant.ticks(), 1000);
    assert_eq!(bench.plant.deadline_tracker().total_misses(), 0);
    assert_eq!(bench.plant.deadline_tracker().cycles(), 999);
    assert_eq!(bench.client.report().cycles, 1000);
    assert_eq!(bench.client.report().out_of_order, 0);

    // The regulator should have pulled the mass toward the origin
    assert!(bench.plant.state()[0].abs() < 0.1);
}

fn drop_commands(ticks: u64) -> SessionConfig {
    let mut cfg = SessionConfig::default();
    cfg.fault_schedule = vec![FaultEvent::new(
        FaultKind::Drop,
        49.5 * DT,
        ticks as f64 * DT,
        FaultTarget::Command,
    )];
    cfg
}

#[test]
fn three_dropped_commands_are_held() {
    let cfg = drop_commands(3);
    let mut bench = Bench::new(&cfg);

    let mut before = 0.0;
    for i in 1..=200 {
        let r = bench.tick(i, fixed);
        assert_eq!(r.status, SafetyStatus::Nominal, "tick {i}");
        match i {
            49 => before = r.applied_command,
            50..=52 => {
                assert_eq!(r.accepted, None);
                assert_eq!(r.held_ticks, (i - 49) as u32);
                assert_eq!(r.applied_command, before);
            }
            53 => {
                assert_eq!(r.accepted, Some(52));
                assert_eq!(r.held_ticks, 0);
            }
            _ => (),
        }
    }
    assert_eq!(bench.plant.intake_stats().fault_dropped, 3);
    assert_eq!(bench.plant.deadline_tracker().total_misses(), 0);
}

#[test]
fn fourth_dropped_command_stops_the_plant() {
    let cfg = drop_commands(4);
    let mut bench = Bench::new(&cfg);

    for i in 1..=52 {
        assert_eq!(bench.tick(i, fixed).status, SafetyStatus::Nominal, "tick {i}");
    }
    let r = bench.tick(53, fixed);
    assert_eq!(r.status, SafetyStatus::EmergencyStop);
    assert_eq!(r.frame.sequence, 53);
    assert_eq!(r.applied_command, 0.0);
    assert_eq!(bench.plant.emergency_reason(), Some(EmergencyReason::HoldLimit));

    // Terminal: a fresh command does not bring it back
    bench.plant.receive(0.535, command(53, 0.5));
    let r = bench.plant.tick(0.54);
    assert_eq!(r.status, SafetyStatus::EmergencyStop);
    assert_eq!(r.applied_command, 0.0);
}

#[test]
fn second_miss_in_window_triggers_once() {
    let cfg = SessionConfig::default();
    let mut bench = Bench::new(&cfg);
    let late = |i: u64| if i == 10 || i == 60 { 0.007 } else { 0.003 };

    let mut stopped_at = None;
    for i in 1..=200 {
        let r = bench.tick(i, late);
        if r.status == SafetyStatus::EmergencyStop {
            stopped_at = Some(i);
            break;
        }
        if i == 11 {
            assert!(r.deadlines[0].missed);
            assert_eq!(r.deadline_status, DeadlineStatus::Warning);
        }
    }

    // The late answer to frame 60 is delivered on tick 61
    assert_eq!(stopped_at, Some(61));
    assert_eq!(bench.plant.emergency_reason(), Some(EmergencyReason::DeadlineBreach));
    assert_eq!(bench.plant.deadline_tracker().total_misses(), 2);
    assert_eq!(bench.plant.deadline_tracker().breaches(), 1);
}

#[test]
fn one_miss_per_window_never_triggers() {
    let cfg = SessionConfig::default();
    let mut bench = Bench::new(&cfg);
    let late = |i: u64| if i % 100 == 10 { 0.007 } else { 0.003 };

    for i in 1..=1000 {
        let r = bench.tick(i, late);
        assert_ne!(r.status, SafetyStatus::EmergencyStop, "tick {i}");
        assert!(r.window_miss_count <= 1);
    }
    assert_eq!(bench.plant.deadline_tracker().total_misses(), 10);
    assert_eq!(bench.plant.deadline_tracker().breaches(), 0);
}

#[test]
fn stale_command_is_never_applied() {
    let cfg = SessionConfig::default();
    let mut plant = PlantServer::new(Box::new(DoubleIntegrator::default()), vec![0.0, 0.0], &cfg);
    for i in 1..=5 {
        plant.tick(i as f64 * DT);
    }

    plant.receive(0.053, command(5, 0.5));
    let r = plant.tick(0.06);
    assert_eq!(r.accepted, Some(5));
    assert_eq!(r.applied_command, 0.5);

    // An older command arriving late, then a duplicate of the current one
    plant.receive(0.062, command(3, -0.9));
    plant.receive(0.064, command(5, 0.7));
    let r = plant.tick(0.07);
    assert_eq!(r.accepted, None);
    assert_eq!(r.applied_command, 0.5);
    assert_eq!(r.held_ticks, 1);
    assert_eq!(plant.intake_stats().stale, 2);
}

#[test]
fn out_of_range_commands_are_clamped() {
    let cfg = SessionConfig::default();
    let mut plant = PlantServer::new(Box::new(DoubleIntegrator::default()), vec![0.0, 0.0], &cfg);
    plant.tick(0.01);

    plant.receive(0.013, command(1, 2.5));
    let r = plant.tick(0.02);
    assert_eq!(r.applied_command, 1.0);
    assert!(r.status >= SafetyStatus::Saturated);

    plant.receive(0.023, command(2, -3.0));
    let r = plant.tick(0.03);
    assert_eq!(r.applied_command, -1.0);
    assert_eq!(r.status, SafetyStatus::Saturated);

    // Saturated does not go back to nominal within a session
    plant.receive(0.033, command(3, 0.1));
    let r = plant.tick(0.04);
    assert_eq!(r.applied_command, 0.1);
    assert_eq!(r.status, SafetyStatus::Saturated);
}

#[test]
fn silence_after_commands_stops_after_hold_limit() {
    let cfg = SessionConfig::default();
    let mut plant = PlantServer::new(Box::new(DoubleIntegrator::default()), vec![0.0, 0.0], &cfg);
    plant.tick(0.01);
    plant.receive(0.013, command(1, 0.25));
    assert_eq!(plant.tick(0.02).applied_command, 0.25);

    for i in 3..=5 {
        let r = plant.tick(i as f64 * DT);
        assert_eq!(r.status, SafetyStatus::Nominal);
        assert_eq!(r.applied_command, 0.25);
    }
    let r = plant.tick(0.06);
    assert_eq!(r.status, SafetyStatus::EmergencyStop);
    assert_eq!(r.held_ticks, 4);
    assert_eq!(plant.emergency_reason(), Some(EmergencyReason::HoldLimit));
}

#[test]
fn state_bound_violation_stops_immediately() {
    let mut cfg = SessionConfig::default();
    cfg.state_bounds = vec![0.05];
    let mut bench = Bench::new(&cfg);
    bench.plant = PlantServer::new(Box::new(DoubleIntegrator::default()), vec![0.049, 1.0], &cfg);

    let r = bench.tick(1, fixed);
    assert_eq!(r.status, SafetyStatus::EmergencyStop);
    assert_eq!(
        bench.plant.emergency_reason(),
        Some(EmergencyReason::StateBound { index: 0 })
    );
}

#[test]
fn failing_law_sends_last_safe_command() {
    let cfg = SessionConfig::default();
    let mut calls = 0;
    let law = move |_: &[f64]| -> Result<f64, ComputeError> {
        calls += 1;
        match calls {
            1 => Ok(0.4),
            2 => Err(ComputeError::Failed("solver diverged".to_string())),
            3 => panic!("law bug"),
            _ => Ok(f64::NAN),
        }
    };
    let mut bench = Bench::new(&cfg);
    bench.client = ControllerClient::new(Box::new(law), &cfg);

    for i in 1..=5 {
        let r = bench.tick(i, fixed);
        assert_eq!(r.status, SafetyStatus::Nominal, "tick {i}");
        if i > 1 {
            assert_eq!(r.applied_command, 0.4, "tick {i}");
        }
    }
    assert_eq!(bench.client.report().compute_failures, 4);
}

#[test]
fn state_latency_fault_is_reported_as_delay() {
    let mut cfg = SessionConfig::default();
    cfg.fault_schedule = vec![FaultEvent::new(
        FaultKind::Latency(2.0),
        0.0,
        1.0,
        FaultTarget::State,
    )];
    let mut client = ControllerClient::new(Box::new(StateFeedback::new(vec![1.0])), &cfg);
    let frame = hil::StateFrame {
        sequence: 1,
        tick_time: 0.01,
        state: vec![0.5],
    };

    let (admitted, delay) = client.admit(0.011, &frame.encode()).unwrap();
    assert_eq!(admitted, frame);
    assert!((delay.as_secs_f64() - 0.002).abs() < 1e-9);
}
