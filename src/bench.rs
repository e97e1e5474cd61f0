//! Wiring between the bench configuration, the instrument backends and the
//! sweep controller.

use crate::config::BenchConfig;
use crate::presets::MeasurementPreset;
use crate::scpi::ScpiBackend;
use anyhow::{Context, Result};
use liv_core::{
    CapabilityFlags, InstrumentBackend, InstrumentRole, LivResult, MeasurementKind, OutputRange,
};
use liv_driver_mock::MockBackend;
use liv_experiment::{InstrumentSet, SessionEvent, SessionSnapshot, SessionState, SweepController};
use liv_storage::CsvExporter;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Result of one completed `run`.
#[derive(Debug)]
pub struct RunReport {
    pub snapshot: SessionSnapshot,
    /// `None` when the session ended before any sample was taken.
    pub export_path: Option<PathBuf>,
}

impl RunReport {
    /// The sweep stopped on an instrument or internal fault. Safety and
    /// operator aborts are not failures.
    pub fn failed(&self) -> bool {
        self.snapshot.state == SessionState::Failed
    }
}

/// Backend selected by the configuration.
pub fn build_backend(config: &BenchConfig, mock: bool) -> Arc<dyn InstrumentBackend> {
    if mock {
        info!("using simulated instrument bench");
        return Arc::new(MockBackend::new());
    }
    let backend = ScpiBackend::new(config.scpi.timeout)
        .with_capabilities(
            InstrumentRole::Source,
            CapabilityFlags {
                pulsing: config.scpi.source_pulsing,
                compliance: true,
            },
        )
        .with_output_ranges(
            OutputRange::symmetric(config.scpi.voltage_range),
            OutputRange::symmetric(config.scpi.current_range),
        );
    Arc::new(backend)
}

/// Connect every instrument `kind` requires.
pub async fn connect_instruments(
    config: &BenchConfig,
    backend: Arc<dyn InstrumentBackend>,
    kind: MeasurementKind,
    mock: bool,
) -> LivResult<InstrumentSet> {
    let addresses = config.addresses_for(kind, mock)?;
    InstrumentSet::connect(backend, addresses).await
}

/// Run `preset` to completion and export the result.
///
/// `shutdown` resolving cancels the sweep; the partial data is still
/// exported.
pub async fn run_preset<F>(
    config: &BenchConfig,
    preset: &MeasurementPreset,
    backend: Arc<dyn InstrumentBackend>,
    mock: bool,
    shutdown: F,
) -> Result<RunReport>
where
    F: Future<Output = ()>,
{
    let kind = preset.measurement.kind;
    let instruments = connect_instruments(config, backend, kind, mock)
        .await
        .context("Failed to connect instruments")?;
    let handle = SweepController::start(preset.measurement.clone(), instruments)
        .await
        .context("Failed to start sweep")?;

    let progress = tokio::spawn(log_progress(handle.subscribe()));

    let snapshot = tokio::select! {
        snapshot = handle.wait() => snapshot,
        _ = shutdown => {
            warn!("shutdown requested, cancelling sweep");
            if let Err(e) = handle.cancel() {
                debug!(error = %e, "cancel after sweep end");
            }
            handle.wait().await
        }
    };
    progress.abort();

    let export_path = if snapshot.samples.is_empty() {
        warn!(state = %snapshot.state, "no samples recorded, nothing exported");
        None
    } else {
        let exporter =
            CsvExporter::new(config.storage.output_dir.clone()).with_device(preset.device.clone());
        Some(exporter.export(&snapshot).context("Failed to export session")?)
    };

    Ok(RunReport {
        snapshot,
        export_path,
    })
}

async fn log_progress(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Sample(sample)) => debug!(
                index = sample.index,
                setpoint = sample.setpoint,
                voltage = ?sample.voltage,
                current = ?sample.current,
                power = ?sample.power,
                "sample"
            ),
            Ok(SessionEvent::StateChanged(status)) => match status.reason {
                Some(reason) => info!(state = %status.state, %reason, "session state"),
                None => info!(state = %status.state, "session state"),
            },
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "progress log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
