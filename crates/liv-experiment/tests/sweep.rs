//! End-to-end sweeps against the simulated bench.
//!
//! All tests run on a paused tokio clock, so settle times and pulse timings
//! are observed exactly through the mock call log.

use liv_core::{
    ComplianceLimits, InstrumentRole, LivError, MeasurementConfig, MeasurementKind, SourceMode,
};
use liv_driver_mock::{
    CallArgs, ErrorConfig, ErrorScenario, MockBackend, MockMode, NoiseModel, Operation,
    TimingConfig,
};
use liv_experiment::{InstrumentSet, SessionEvent, SessionState, SweepController, TerminalReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_test::traced_test;

fn quiet_bench() -> Arc<MockBackend> {
    Arc::new(MockBackend::builder().noise(NoiseModel::none()).build())
}

async fn connect(mock: &Arc<MockBackend>, kind: MeasurementKind) -> InstrumentSet {
    let addresses = kind
        .required_roles()
        .iter()
        .map(|role| (*role, format!("mock::{:?}", role)));
    InstrumentSet::connect(mock.clone(), addresses).await.unwrap()
}

fn set_output_levels(mock: &MockBackend) -> Vec<f64> {
    mock.calls_of(Operation::SetOutput)
        .into_iter()
        .filter_map(|c| match c.args {
            CallArgs::Level(v) => Some(v),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_sweep_visits_every_setpoint() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Liv).await;
    let config = MeasurementConfig::builder(MeasurementKind::Liv)
        .cw(SourceMode::Voltage)
        .sweep(0.0, 10.0, 2.0)
        .settle_time(Duration::from_millis(5))
        .limits(ComplianceLimits::new(12.0, 2.0))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    let snapshot = handle.wait().await;

    assert_eq!(snapshot.state, SessionState::Complete);
    assert_eq!(snapshot.reason, None);
    let setpoints: Vec<f64> = snapshot.samples.iter().map(|s| s.setpoint).collect();
    assert_eq!(setpoints, vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);

    // Initial zero, every setpoint, then the final park
    assert_eq!(
        set_output_levels(&mock),
        vec![0.0, 0.0, 2.0, 4.0, 6.0, 8.0, 10.0, 0.0]
    );
    assert!(!mock.output_enabled());
    assert_eq!(mock.connected_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_step_sign_mismatch_is_rejected_before_any_command() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Liv).await;
    let config = MeasurementConfig::builder(MeasurementKind::Liv)
        .cw(SourceMode::Voltage)
        .sweep(0.0, 10.0, -2.0)
        .build();

    let err = SweepController::start(config, instruments).await.unwrap_err();
    assert!(matches!(err, LivError::Config(_)));
    assert_eq!(mock.operation_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_channel_is_rejected_before_any_command() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Li).await;
    let config = MeasurementConfig::builder(MeasurementKind::Liv)
        .sweep(0.0, 0.01, 0.001)
        .build();

    match SweepController::start(config, instruments).await {
        Err(LivError::MissingInstrument { role, kind }) => {
            assert_eq!(role, InstrumentRole::Voltmeter);
            assert_eq!(kind, MeasurementKind::Liv);
        }
        other => panic!("expected MissingInstrument, got {:?}", other.map(|_| ())),
    }
    assert_eq!(mock.operation_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_over_current_aborts_and_parks_output() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Liv).await;
    // Above 2.1 V the simulated diode draws more than 120 mA
    let config = MeasurementConfig::builder(MeasurementKind::Liv)
        .cw(SourceMode::Voltage)
        .sweep(0.0, 3.0, 0.5)
        .settle_time(Duration::from_millis(1))
        .limits(ComplianceLimits::new(5.0, 0.12))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    let snapshot = handle.wait().await;

    assert_eq!(snapshot.state, SessionState::Aborted);
    assert_eq!(snapshot.reason, Some(TerminalReason::OverCurrent));
    let last = snapshot.samples.last().unwrap();
    assert_eq!(last.setpoint, 2.0);
    assert!(last.setpoint < 3.0);
    assert!(snapshot.samples.iter().all(|s| s.current.unwrap() <= 0.12));

    // The violating step read its channels, then the source was parked
    let calls = mock.calls();
    let last_read = calls
        .iter()
        .rposition(|c| c.operation == Operation::Read)
        .unwrap();
    let after: Vec<_> = calls[last_read + 1..]
        .iter()
        .filter(|c| c.role == InstrumentRole::Source && c.operation != Operation::Disconnect)
        .map(|c| (c.operation, c.args))
        .collect();
    assert_eq!(
        after,
        vec![
            (Operation::SetOutput, CallArgs::Level(0.0)),
            (Operation::EnableOutput, CallArgs::Enable(false)),
        ]
    );
    assert!(!mock.output_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_setpoint_above_limit_is_never_applied() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Iv).await;
    let config = MeasurementConfig::builder(MeasurementKind::Iv)
        .cw(SourceMode::Current)
        .sweep(0.0, 0.05, 0.01)
        .limits(ComplianceLimits::new(5.0, 0.025))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    let snapshot = handle.wait().await;

    assert_eq!(snapshot.reason, Some(TerminalReason::OverCurrent));
    assert_eq!(snapshot.samples.len(), 3);
    assert!(set_output_levels(&mock).iter().all(|level| *level <= 0.025));
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_is_stable_between_steps() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Li).await;
    let config = MeasurementConfig::builder(MeasurementKind::Li)
        .sweep(0.0, 0.05, 0.005)
        .settle_time(Duration::from_millis(10))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    tokio::time::sleep(Duration::from_millis(35)).await;

    let first = handle.snapshot();
    let second = handle.snapshot();
    assert_eq!(first, second);
    assert_eq!(first.state, SessionState::Running);
    assert!(!first.samples.is_empty());

    let last = handle.wait().await;
    assert_eq!(last.samples.len(), 11);
    assert_eq!(&last.samples[..first.samples.len()], &first.samples[..]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_settle_stops_within_one_settle_time() {
    let settle = Duration::from_millis(100);
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Liv).await;
    let config = MeasurementConfig::builder(MeasurementKind::Liv)
        .sweep(0.0, 0.05, 0.001)
        .settle_time(settle)
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let cancelled_at = Instant::now();
    handle.cancel().unwrap();
    let snapshot = handle.wait().await;

    assert!(cancelled_at.elapsed() < settle);
    assert_eq!(snapshot.state, SessionState::Aborted);
    assert_eq!(snapshot.reason, Some(TerminalReason::UserCancelled));
    assert_eq!(snapshot.samples.len(), 1);
    assert!(!mock.output_enabled());
    assert_eq!(mock.output_level(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_current_pulses_have_exact_width_and_spacing() {
    // Whole milliseconds keep the paused clock on timer ticks
    let width = Duration::from_millis(4);
    let period = Duration::from_millis(10);
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Li).await;
    let config = MeasurementConfig::builder(MeasurementKind::Li)
        .current_pulsed(width, period)
        .sweep(0.0, 0.03, 0.01)
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    let snapshot = handle.wait().await;
    assert_eq!(snapshot.state, SessionState::Complete);

    let events = mock.enable_events();
    let pulses: Vec<(Instant, Instant)> = events
        .windows(2)
        .filter_map(|w| match (w[0], w[1]) {
            ((true, on), (false, off)) => Some((on, off)),
            _ => None,
        })
        .collect();

    assert_eq!(pulses.len(), 4);
    for (on, off) in &pulses {
        assert_eq!(*off - *on, width);
    }
    for pair in pulses.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= period);
    }

    // Sampled inside the pulse: the last step sits above threshold
    let last = snapshot.samples.last().unwrap();
    let expected = mock.diode().optical_power(0.03);
    assert!((last.power.unwrap() - expected).abs() < 1e-12);
    assert_eq!(last.current, Some(0.03));
    assert_eq!(last.voltage, None);
}

#[tokio::test(start_paused = true)]
async fn test_pause_parks_output_until_resume() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Li).await;
    let config = MeasurementConfig::builder(MeasurementKind::Li)
        .sweep(0.0, 0.01, 0.001)
        .settle_time(Duration::from_millis(10))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    tokio::time::sleep(Duration::from_millis(25)).await;
    handle.pause().unwrap();

    let mut status = handle.session().watch_status();
    status
        .wait_for(|s| s.state == SessionState::Paused)
        .await
        .unwrap();
    drop(status);

    assert!(!mock.output_enabled());
    assert_eq!(mock.output_level(), 0.0);
    let held = handle.snapshot().samples.len();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.snapshot().samples.len(), held);
    assert_eq!(handle.state(), SessionState::Paused);

    handle.resume().unwrap();
    let snapshot = handle.wait().await;
    assert_eq!(snapshot.state, SessionState::Complete);
    assert_eq!(snapshot.samples.len(), 11);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_paused() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Li).await;
    let config = MeasurementConfig::builder(MeasurementKind::Li)
        .sweep(0.0, 0.01, 0.001)
        .settle_time(Duration::from_millis(10))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    handle.pause().unwrap();
    let mut status = handle.session().watch_status();
    status
        .wait_for(|s| s.state == SessionState::Paused)
        .await
        .unwrap();
    drop(status);

    handle.cancel().unwrap();
    let snapshot = handle.wait().await;
    assert_eq!(snapshot.reason, Some(TerminalReason::UserCancelled));
}

#[tokio::test(start_paused = true)]
async fn test_instrument_fault_fails_the_session() {
    let mock = Arc::new(
        MockBackend::builder()
            .noise(NoiseModel::none())
            .error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN {
                operation: Operation::Read,
                count: 5,
            }))
            .build(),
    );
    let instruments = connect(&mock, MeasurementKind::Li).await;
    let config = MeasurementConfig::builder(MeasurementKind::Li)
        .sweep(0.0, 0.01, 0.001)
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    let snapshot = handle.wait().await;

    assert_eq!(snapshot.state, SessionState::Failed);
    match snapshot.reason {
        Some(TerminalReason::Failure(message)) => assert!(message.contains("injected failure")),
        other => panic!("unexpected reason {:?}", other),
    }
    // Two reads per L-I step: steps 0 and 1 complete, step 2 fails mid-way
    assert_eq!(snapshot.samples.len(), 2);
    assert!(!mock.output_enabled());
    // No retry of the failed read
    assert_eq!(mock.calls_of(Operation::Read).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_events_follow_the_sweep() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Iv).await;
    let config = MeasurementConfig::builder(MeasurementKind::Iv)
        .sweep(0.0, 0.02, 0.005)
        .settle_time(Duration::from_millis(1))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    let mut events = handle.subscribe();
    let snapshot = handle.wait().await;

    let mut samples = 0;
    let mut terminal = None;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Sample(_) => samples += 1,
            SessionEvent::StateChanged(status) => terminal = Some(status.state),
        }
    }
    assert_eq!(samples, snapshot.samples.len());
    assert_eq!(terminal, Some(SessionState::Complete));

    // I-V samples carry both electrical channels and no power
    let sample = &snapshot.samples[2];
    assert_eq!(sample.current, Some(0.01));
    assert!((sample.voltage.unwrap() - mock.diode().voltage_at(0.01)).abs() < 1e-12);
    assert_eq!(sample.power, None);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_slow_channels_warn_but_do_not_fail() {
    let mock = Arc::new(
        MockBackend::builder()
            .noise(NoiseModel::none())
            .mode(MockMode::Realistic)
            .timing(TimingConfig::source_measure_unit())
            .build(),
    );
    let instruments = connect(&mock, MeasurementKind::Liv).await;
    let config = MeasurementConfig::builder(MeasurementKind::Liv)
        .sweep(0.0, 0.02, 0.01)
        .settle_time(Duration::from_millis(2))
        .max_channel_skew(Duration::from_millis(1))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    let snapshot = handle.wait().await;

    assert_eq!(snapshot.state, SessionState::Complete);
    assert_eq!(snapshot.samples.len(), 3);
    // Three reads of 3 ms each follow the first
    assert!(snapshot
        .samples
        .iter()
        .all(|s| s.channel_skew >= Duration::from_millis(9)));
    assert!(logs_contain("channel skew above bound"));
}

#[tokio::test(start_paused = true)]
async fn test_voltage_pulsed_liv_samples_mid_pulse() {
    let width = Duration::from_millis(4);
    let period = Duration::from_millis(10);
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Liv).await;
    let config = MeasurementConfig::builder(MeasurementKind::Liv)
        .voltage_pulsed(width, period)
        .sweep(1.6, 2.0, 0.1)
        .limits(ComplianceLimits::new(5.0, 0.5))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    let snapshot = handle.wait().await;
    assert_eq!(snapshot.state, SessionState::Complete);
    assert_eq!(snapshot.samples.len(), 5);

    let pulses: Vec<(Instant, Instant)> = mock
        .enable_events()
        .windows(2)
        .filter_map(|w| match (w[0], w[1]) {
            ((true, on), (false, off)) => Some((on, off)),
            _ => None,
        })
        .collect();
    assert_eq!(pulses.len(), 5);

    // Four channels per step, all read half a width into their pulse
    let reads = mock.calls_of(Operation::Read);
    assert_eq!(reads.len(), 20);
    for (step, chunk) in reads.chunks(4).enumerate() {
        let (on, off) = pulses[step];
        for read in chunk {
            assert!(read.at > on && read.at < off);
            assert_eq!(read.at - on, width / 2);
        }
    }

    for sample in &snapshot.samples {
        let expected = mock.diode().current_at(sample.setpoint);
        assert!(expected > 0.0);
        assert!((sample.current.unwrap() - expected).abs() < 1e-12);
        assert!((sample.voltage.unwrap() - sample.setpoint).abs() < 1e-12);
        assert!(sample.power.unwrap() > 0.0);
    }
    assert!(!mock.output_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_over_voltage_in_current_mode_aborts_and_parks_output() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Liv).await;
    // 1.7 V at 40 mA, 1.8 V at 60 mA
    let config = MeasurementConfig::builder(MeasurementKind::Liv)
        .cw(SourceMode::Current)
        .sweep(0.0, 0.1, 0.02)
        .settle_time(Duration::from_millis(1))
        .limits(ComplianceLimits::new(1.75, 0.5))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    let snapshot = handle.wait().await;

    assert_eq!(snapshot.state, SessionState::Aborted);
    assert_eq!(snapshot.reason, Some(TerminalReason::OverVoltage));
    let setpoints: Vec<f64> = snapshot.samples.iter().map(|s| s.setpoint).collect();
    assert_eq!(setpoints.len(), 3);
    assert!((setpoints[2] - 0.04).abs() < 1e-12);
    assert!(snapshot.samples.iter().all(|s| s.voltage.unwrap() <= 1.75));

    // The violating level was applied and read, nothing above it
    let levels = set_output_levels(&mock);
    assert!(levels.iter().all(|level| *level <= 0.06 + 1e-12));
    assert_eq!(levels.last(), Some(&0.0));
    assert!(!mock.output_enabled());
    assert_eq!(mock.output_level(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_over_power_aborts_the_sweep() {
    let mock = quiet_bench();
    let instruments = connect(&mock, MeasurementKind::Li).await;
    // About 20 mW at 40 mA, 36 mW at 60 mA
    let config = MeasurementConfig::builder(MeasurementKind::Li)
        .cw(SourceMode::Current)
        .sweep(0.0, 0.1, 0.02)
        .settle_time(Duration::from_millis(1))
        .limits(ComplianceLimits::new(5.0, 0.5).with_max_power(0.03))
        .build();

    let handle = SweepController::start(config, instruments).await.unwrap();
    let snapshot = handle.wait().await;

    assert_eq!(snapshot.state, SessionState::Aborted);
    assert_eq!(snapshot.reason, Some(TerminalReason::OverPower));
    assert_eq!(snapshot.samples.len(), 3);
    assert!(snapshot.samples.iter().all(|s| s.power.unwrap() <= 0.03));
    assert!(!mock.output_enabled());
    assert_eq!(mock.output_level(), 0.0);
}
