//! Sweep controller: drives one measurement session to completion.
//!
//! [`SweepController::start`] validates the configuration, checks instrument
//! coverage and spawns a worker task that owns the [`InstrumentSet`]. The
//! caller keeps a [`SessionHandle`] to pause, resume, cancel and observe the
//! run.
//!
//! # Step sequence
//!
//! ```text
//! checkpoint ─▶ pre-check ─▶ apply ─▶ sample ─▶ post-check ─▶ append
//!     ▲                                                          │
//!     └──────────────────────── next setpoint ◀──────────────────┘
//! ```
//!
//! CW runs keep the output enabled for the whole sweep and wait the settle
//! time after each setpoint. Pulsed runs enable the output for exactly one
//! pulse width per step and sample at the middle of the pulse:
//!
//! ```text
//!            t0          t0+W/2        t0+W
//! enable ────┐             │             ┌──── disable
//!            └─────── sample here ───────┘
//! ```
//!
//! Consecutive pulse starts are at least one period apart.
//!
//! Control requests travel over a `watch` channel. Pause and resume are
//! honoured between steps; cancel also interrupts any settle or pulse wait.
//! Whatever ends the run, the source is parked (level zero, output disabled)
//! before the terminal state is published.
//!
//! # Usage
//!
//! ```rust,ignore
//! let instruments = InstrumentSet::connect(backend, addresses).await?;
//! let handle = SweepController::start(config, instruments).await?;
//!
//! let mut events = handle.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//! });
//!
//! let snapshot = handle.wait().await;
//! ```

use crate::instruments::InstrumentSet;
use crate::plans::SetpointPlan;
use crate::session::{
    MeasurementSession, SessionEvent, SessionSnapshot, SessionState, TerminalReason,
};
use chrono::Utc;
use liv_core::capabilities::{InstrumentBackend, InstrumentHandle, InstrumentRole, SourceMode};
use liv_core::config::{MeasurementConfig, MeasurementKind, PulseTiming};
use liv_core::data::SamplePoint;
use liv_core::error::{LivError, LivResult};
use liv_core::limits::{SafetyGuard, Verdict, ViolationReason};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Request from the handle to the sweep task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

/// Why the step loop stopped before the plan was exhausted.
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    Violation(ViolationReason),
    Fault(LivError),
}

impl From<LivError> for Interrupt {
    fn from(err: LivError) -> Self {
        Interrupt::Fault(err)
    }
}

// =============================================================================
// SweepController
// =============================================================================

pub struct SweepController;

impl SweepController {
    /// Validate `config`, check instrument coverage and start the sweep.
    ///
    /// Fails with `Config` for an invalid configuration, `MissingInstrument`
    /// when a required channel is not connected and `UnsupportedOperation`
    /// when a pulsed regime is requested from a source without pulsing. No
    /// instrument command is issued on any of these paths.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        config: MeasurementConfig,
        instruments: InstrumentSet,
    ) -> LivResult<SessionHandle> {
        let session = Arc::new(MeasurementSession::new(config)?);
        let config = session.config().clone();

        instruments.check_coverage(config.kind)?;
        let source = instruments
            .get(InstrumentRole::Source)
            .cloned()
            .ok_or(LivError::MissingInstrument {
                role: InstrumentRole::Source,
                kind: config.kind,
            })?;
        if config.regime.is_pulsed() && !source.capabilities().pulsing {
            return Err(LivError::UnsupportedOperation(format!(
                "pulsed {} sweep needs a source with pulsing support, {} has none",
                config.kind,
                source.identifier()
            )));
        }

        let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
        session.transition(SessionState::Running)?;
        info!(
            session = %session.id(),
            kind = %config.kind,
            points = SetpointPlan::new(config.sweep).len(),
            "starting sweep"
        );

        let worker = SweepWorker::new(session.clone(), instruments, source, control_rx);
        let span = info_span!("sweep", session = %session.id());
        let task = tokio::spawn(worker.run().instrument(span));

        Ok(SessionHandle {
            session,
            control: control_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

// =============================================================================
// SessionHandle
// =============================================================================

/// Control surface of a running session.
///
/// Dropping the handle cancels the sweep.
pub struct SessionHandle {
    session: Arc<MeasurementSession>,
    control: watch::Sender<ControlSignal>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Request a pause. Takes effect before the next setpoint is applied.
    pub fn pause(&self) -> LivResult<()> {
        self.ensure_live("pause")?;
        if *self.control.borrow() == ControlSignal::Cancel {
            return Err(LivError::InvalidState("session is being cancelled".into()));
        }
        self.control.send_replace(ControlSignal::Pause);
        debug!(session = %self.session.id(), "pause requested");
        Ok(())
    }

    /// Resume a paused session, or withdraw a pause not yet honoured.
    pub fn resume(&self) -> LivResult<()> {
        self.ensure_live("resume")?;
        if *self.control.borrow() != ControlSignal::Pause {
            return Err(LivError::InvalidState("session is not paused".into()));
        }
        self.control.send_replace(ControlSignal::Run);
        debug!(session = %self.session.id(), "resume requested");
        Ok(())
    }

    /// Stop the sweep. Interrupts any wait in progress.
    pub fn cancel(&self) -> LivResult<()> {
        self.ensure_live("cancel")?;
        self.control.send_replace(ControlSignal::Cancel);
        info!(session = %self.session.id(), "cancel requested");
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub fn session(&self) -> &Arc<MeasurementSession> {
        &self.session
    }

    /// Wait for the sweep to reach a terminal state and return the final
    /// snapshot.
    pub async fn wait(&self) -> SessionSnapshot {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(session = %self.session.id(), error = %e, "sweep task ended abnormally");
                if !self.session.state().is_terminal() {
                    let _ = self.session.finish(
                        SessionState::Failed,
                        Some(TerminalReason::Failure(format!("sweep task ended: {}", e))),
                    );
                }
            }
        }

        let mut status = self.session.watch_status();
        let _ = status.wait_for(|s| s.state.is_terminal()).await;
        self.session.snapshot()
    }

    fn ensure_live(&self, action: &str) -> LivResult<()> {
        let state = self.session.state();
        if state.is_terminal() {
            return Err(LivError::InvalidState(format!(
                "cannot {} a session that is {}",
                action, state
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// SweepWorker
// =============================================================================

/// Meter handles sampled after the source feedback, in read order.
struct Channels {
    voltmeter: Option<InstrumentHandle>,
    ammeter: Option<InstrumentHandle>,
    power_meter: Option<InstrumentHandle>,
}

struct SweepWorker {
    session: Arc<MeasurementSession>,
    config: Arc<MeasurementConfig>,
    instruments: InstrumentSet,
    backend: Arc<dyn InstrumentBackend>,
    source: InstrumentHandle,
    channels: Channels,
    control: watch::Receiver<ControlSignal>,
    run_start: Instant,
    last_pulse_start: Option<Instant>,
}

impl SweepWorker {
    fn new(
        session: Arc<MeasurementSession>,
        instruments: InstrumentSet,
        source: InstrumentHandle,
        control: watch::Receiver<ControlSignal>,
    ) -> Self {
        let config = session.config().clone();
        let kind = config.kind;
        let pick = |role: InstrumentRole, wanted: bool| {
            if wanted {
                instruments.get(role).cloned()
            } else {
                None
            }
        };
        let channels = Channels {
            voltmeter: pick(InstrumentRole::Voltmeter, kind.measures_electrical()),
            ammeter: pick(InstrumentRole::Ammeter, kind.measures_electrical()),
            power_meter: pick(InstrumentRole::OpticalPowerMeter, kind.measures_power()),
        };
        Self {
            backend: instruments.backend().clone(),
            session,
            config,
            instruments,
            source,
            channels,
            control,
            run_start: Instant::now(),
            last_pulse_start: None,
        }
    }

    async fn run(mut self) {
        let (state, reason) = match self.execute().await {
            Ok(()) => (SessionState::Complete, None),
            Err(Interrupt::Cancelled) => (SessionState::Aborted, Some(TerminalReason::UserCancelled)),
            Err(Interrupt::Violation(reason)) => (SessionState::Aborted, Some(reason.into())),
            Err(Interrupt::Fault(e)) => {
                error!(error = %e, "instrument error, stopping sweep");
                (SessionState::Failed, Some(TerminalReason::Failure(e.to_string())))
            }
        };

        if let Err(e) = self.park().await {
            error!(error = %e, "failed to park source output");
        }
        let failures = self.instruments.disconnect_all().await;
        if failures > 0 {
            warn!(failures, "some instruments did not disconnect cleanly");
        }

        info!(
            state = %state,
            reason = ?reason,
            samples = self.session.len(),
            elapsed = ?self.run_start.elapsed(),
            "sweep finished"
        );
        if let Err(e) = self.session.finish(state, reason) {
            error!(error = %e, "could not publish terminal state");
        }
    }

    async fn execute(&mut self) -> Result<(), Interrupt> {
        let config = self.config.clone();
        self.setup().await?;
        self.run_start = Instant::now();

        for (index, setpoint) in SetpointPlan::new(config.sweep) {
            self.checkpoint().await?;

            if let Verdict::Violation(reason) = SafetyGuard::pre_check(&config, setpoint) {
                warn!(index, setpoint, %reason, "setpoint exceeds configured limit");
                return Err(Interrupt::Violation(reason));
            }

            let sample = match config.pulse() {
                None => self.cw_step(index, setpoint).await?,
                Some(pulse) => self.pulsed_step(index, setpoint, pulse).await?,
            };

            if let Verdict::Violation(reason) = SafetyGuard::post_check(&config, &sample) {
                warn!(
                    index,
                    setpoint,
                    %reason,
                    voltage = ?sample.voltage,
                    current = ?sample.current,
                    power = ?sample.power,
                    "reading exceeds configured limit"
                );
                return Err(Interrupt::Violation(reason));
            }

            debug!(index, setpoint, "sample recorded");
            self.session.append(sample);
        }
        Ok(())
    }

    /// Program the source and bring it to a safe starting level.
    async fn setup(&mut self) -> LivResult<()> {
        let mode = self.config.source_mode();
        self.backend.configure_source(&self.source, mode).await?;

        if self.source.capabilities().compliance {
            let limit = self.config.limits.compliance_for(mode);
            self.backend.set_compliance(&self.source, limit).await?;
            debug!(limit, "hardware compliance set");
        } else {
            debug!("source has no hardware compliance, relying on software limits");
        }

        self.backend.set_output(&self.source, 0.0).await?;
        if !self.config.regime.is_pulsed() {
            self.backend.enable_output(&self.source, true).await?;
        }
        Ok(())
    }

    async fn cw_step(&mut self, index: usize, setpoint: f64) -> Result<SamplePoint, Interrupt> {
        self.backend.set_output(&self.source, setpoint).await?;
        self.wait_for(self.config.settle_time).await?;
        Ok(self.sample(index, setpoint).await?)
    }

    async fn pulsed_step(
        &mut self,
        index: usize,
        setpoint: f64,
        pulse: PulseTiming,
    ) -> Result<SamplePoint, Interrupt> {
        self.backend.set_output(&self.source, setpoint).await?;
        self.wait_for(self.config.settle_time).await?;
        self.backend
            .configure_pulse(&self.source, pulse.width, pulse.period)
            .await?;

        if let Some(previous) = self.last_pulse_start {
            self.wait_until(previous + pulse.period).await?;
        }

        let t0 = Instant::now();
        self.backend.enable_output(&self.source, true).await?;
        self.last_pulse_start = Some(t0);

        self.wait_until(t0 + pulse.width / 2).await?;
        let sample = self.sample(index, setpoint).await?;

        self.wait_until(t0 + pulse.width).await?;
        self.backend.enable_output(&self.source, false).await?;
        Ok(sample)
    }

    /// Read every channel in fixed order: source feedback, voltage, current,
    /// optical power.
    async fn sample(&self, index: usize, setpoint: f64) -> LivResult<SamplePoint> {
        let source_feedback = self.backend.read(&self.source).await?;
        let first = Instant::now();
        let timestamp = Utc::now();

        let mut voltage = read_channel(self.backend.as_ref(), self.channels.voltmeter.as_ref()).await?;
        let mut current = read_channel(self.backend.as_ref(), self.channels.ammeter.as_ref()).await?;
        let power = read_channel(self.backend.as_ref(), self.channels.power_meter.as_ref()).await?;
        let channel_skew = Instant::now().saturating_duration_since(first);

        if self.config.kind == MeasurementKind::Li {
            match self.config.source_mode() {
                SourceMode::Voltage => voltage = Some(source_feedback),
                SourceMode::Current => current = Some(source_feedback),
            }
        }

        let max_skew = self.config.effective_max_skew();
        if channel_skew > max_skew {
            warn!(index, skew = ?channel_skew, max = ?max_skew, "channel skew above bound");
        }

        Ok(SamplePoint {
            index,
            setpoint,
            source_feedback,
            voltage,
            current,
            power,
            elapsed: first.saturating_duration_since(self.run_start),
            timestamp,
            channel_skew,
        })
    }

    /// Honour pause and cancel requests between steps.
    async fn checkpoint(&mut self) -> Result<(), Interrupt> {
        if self.control.has_changed().is_err() {
            debug!("session handle dropped");
            return Err(Interrupt::Cancelled);
        }
        let signal = *self.control.borrow_and_update();
        match signal {
            ControlSignal::Run => Ok(()),
            ControlSignal::Cancel => Err(Interrupt::Cancelled),
            ControlSignal::Pause => self.hold().await,
        }
    }

    /// Park the source and wait for resume or cancel.
    async fn hold(&mut self) -> Result<(), Interrupt> {
        self.park().await?;
        self.session.transition(SessionState::Paused)?;

        loop {
            if self.control.changed().await.is_err() {
                return Err(Interrupt::Cancelled);
            }
            let signal = *self.control.borrow_and_update();
            match signal {
                ControlSignal::Pause => continue,
                ControlSignal::Cancel => return Err(Interrupt::Cancelled),
                ControlSignal::Run => break,
            }
        }

        if !self.config.regime.is_pulsed() {
            self.backend.enable_output(&self.source, true).await?;
        }
        self.session.transition(SessionState::Running)?;
        Ok(())
    }

    async fn wait_for(&mut self, duration: Duration) -> Result<(), Interrupt> {
        self.wait_until(Instant::now() + duration).await
    }

    /// Sleep until `deadline` unless a cancel arrives first. Pause requests
    /// are left for the next checkpoint.
    async fn wait_until(&mut self, deadline: Instant) -> Result<(), Interrupt> {
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Ok(()),
                changed = self.control.changed() => {
                    if changed.is_err() || *self.control.borrow() == ControlSignal::Cancel {
                        return Err(Interrupt::Cancelled);
                    }
                }
            }
        }
    }

    /// Set the source to zero and disable its output.
    async fn park(&self) -> LivResult<()> {
        let zeroed = self.backend.set_output(&self.source, 0.0).await;
        let disabled = self.backend.enable_output(&self.source, false).await;
        zeroed.and(disabled)
    }
}

async fn read_channel(
    backend: &dyn InstrumentBackend,
    handle: Option<&InstrumentHandle>,
) -> LivResult<Option<f64>> {
    match handle {
        Some(handle) => Ok(Some(backend.read(handle).await?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liv_core::capabilities::CapabilityFlags;
    use liv_core::config::ComplianceLimits;
    use liv_driver_mock::{MockBackend, NoiseModel};

    async fn bench(mock: &Arc<MockBackend>, roles: &[InstrumentRole]) -> InstrumentSet {
        InstrumentSet::connect(
            mock.clone(),
            roles.iter().map(|role| (*role, format!("mock::{}", role))),
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn pulsed_run_needs_pulsing_source() {
        let mock = Arc::new(
            MockBackend::builder()
                .capabilities(InstrumentRole::Source, CapabilityFlags::NONE)
                .build(),
        );
        let instruments = bench(&mock, MeasurementKind::Li.required_roles()).await;
        let config = MeasurementConfig::builder(MeasurementKind::Li)
            .current_pulsed(Duration::from_micros(100), Duration::from_millis(1))
            .sweep(0.0, 0.02, 0.01)
            .build();

        let err = SweepController::start(config, instruments).await.unwrap_err();
        assert!(matches!(err, LivError::UnsupportedOperation(_)));
        assert_eq!(mock.operation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn source_without_compliance_skips_hardware_limit() {
        let mock = Arc::new(
            MockBackend::builder()
                .noise(NoiseModel::none())
                .capabilities(InstrumentRole::Source, CapabilityFlags::NONE)
                .build(),
        );
        let instruments = bench(&mock, MeasurementKind::Iv.required_roles()).await;
        let config = MeasurementConfig::builder(MeasurementKind::Iv)
            .sweep(0.0, 0.02, 0.01)
            .limits(ComplianceLimits::new(3.0, 0.05))
            .build();

        let handle = SweepController::start(config, instruments).await.unwrap();
        let snapshot = handle.wait().await;

        assert_eq!(snapshot.state, SessionState::Complete);
        assert_eq!(mock.compliance(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn compliance_programs_the_undriven_quantity() {
        let mock = Arc::new(MockBackend::builder().noise(NoiseModel::none()).build());
        let instruments = bench(&mock, MeasurementKind::Iv.required_roles()).await;
        let config = MeasurementConfig::builder(MeasurementKind::Iv)
            .sweep(0.0, 0.02, 0.01)
            .limits(ComplianceLimits::new(3.0, 0.05))
            .build();

        let handle = SweepController::start(config, instruments).await.unwrap();
        handle.wait().await;

        assert_eq!(mock.compliance(), Some(3.0));
        assert_eq!(mock.source_mode(), SourceMode::Current);
    }

    #[tokio::test(start_paused = true)]
    async fn control_calls_on_finished_session_are_rejected() {
        let mock = Arc::new(MockBackend::new());
        let instruments = bench(&mock, MeasurementKind::Li.required_roles()).await;
        let config = MeasurementConfig::builder(MeasurementKind::Li)
            .sweep(0.0, 0.01, 0.01)
            .build();

        let handle = SweepController::start(config, instruments).await.unwrap();
        handle.wait().await;

        assert!(matches!(handle.pause(), Err(LivError::InvalidState(_))));
        assert!(matches!(handle.cancel(), Err(LivError::InvalidState(_))));
        assert!(matches!(handle.resume(), Err(LivError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_without_pause_is_rejected() {
        let mock = Arc::new(MockBackend::new());
        let instruments = bench(&mock, MeasurementKind::Li.required_roles()).await;
        let config = MeasurementConfig::builder(MeasurementKind::Li)
            .sweep(0.0, 0.01, 0.001)
            .settle_time(Duration::from_millis(10))
            .build();

        let handle = SweepController::start(config, instruments).await.unwrap();
        assert!(matches!(handle.resume(), Err(LivError::InvalidState(_))));
        handle.cancel().unwrap();
        handle.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels() {
        let mock = Arc::new(MockBackend::new());
        let instruments = bench(&mock, MeasurementKind::Li.required_roles()).await;
        let config = MeasurementConfig::builder(MeasurementKind::Li)
            .sweep(0.0, 0.05, 0.001)
            .settle_time(Duration::from_millis(50))
            .build();

        let handle = SweepController::start(config, instruments).await.unwrap();
        let session = handle.session().clone();
        let mut status = session.watch_status();
        drop(handle);

        status.wait_for(|s| s.state.is_terminal()).await.unwrap();
        assert_eq!(session.reason(), Some(TerminalReason::UserCancelled));
        assert!(!mock.output_enabled());
        assert_eq!(mock.connected_count(), 0);
    }
}
