//! Simulated bench implementing [`InstrumentBackend`].
//!
//! Every handle issued by one [`MockBackend`] observes the same simulated
//! laser diode, like a real bench where the source, meters and photodetector
//! are all wired to one device. Readings follow the drive level only while the
//! source output is enabled, so pulsed sweeps must sample inside the pulse.
//!
//! Successful operations after `connect` are appended to a call log stamped
//! with `tokio::time::Instant`, which under a paused test clock gives exact
//! simulated timings.

use crate::common::{ErrorConfig, MockMode, MockRng, Operation, TimingConfig};
use crate::diode::{LaserDiodeModel, NoiseModel};
use async_trait::async_trait;
use liv_core::capabilities::{
    CapabilityFlags, InstrumentBackend, InstrumentHandle, InstrumentRole, OutputRange, SourceMode,
};
use liv_core::config::PulseTiming;
use liv_core::error::{DriverError, DriverErrorKind, LivError, LivResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// =============================================================================
// Call log
// =============================================================================

/// Arguments of a logged call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallArgs {
    None,
    Level(f64),
    Enable(bool),
    Mode(SourceMode),
    Pulse(PulseTiming),
}

/// One successful backend operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub handle_id: u64,
    pub role: InstrumentRole,
    pub operation: Operation,
    pub args: CallArgs,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct SourceState {
    mode: SourceMode,
    level: f64,
    enabled: bool,
    compliance: Option<f64>,
    pulse: Option<PulseTiming>,
}

impl Default for SourceState {
    fn default() -> Self {
        Self {
            mode: SourceMode::Current,
            level: 0.0,
            enabled: false,
            compliance: None,
            pulse: None,
        }
    }
}

#[derive(Debug, Default)]
struct Bench {
    next_id: u64,
    connected: HashMap<u64, InstrumentRole>,
    connects: usize,
    source: SourceState,
    calls: Vec<CallRecord>,
}

impl Bench {
    fn record(&mut self, handle: &InstrumentHandle, operation: Operation, args: CallArgs) {
        self.calls.push(CallRecord {
            handle_id: handle.id(),
            role: handle.role(),
            operation,
            args,
            at: Instant::now(),
        });
    }
}

fn driver_name(role: InstrumentRole) -> &'static str {
    match role {
        InstrumentRole::Source => "mock_source",
        InstrumentRole::Voltmeter => "mock_voltmeter",
        InstrumentRole::Ammeter => "mock_ammeter",
        InstrumentRole::OpticalPowerMeter => "mock_power_meter",
    }
}

fn default_capabilities(role: InstrumentRole) -> CapabilityFlags {
    match role {
        InstrumentRole::Source => CapabilityFlags::ALL,
        _ => CapabilityFlags::NONE,
    }
}

// =============================================================================
// MockBackend
// =============================================================================

/// Simulated instrument bench.
///
/// # Example
///
/// ```rust,ignore
/// let backend = MockBackend::builder()
///     .seed(7)
///     .noise(NoiseModel::none())
///     .build();
/// let source = backend.connect(InstrumentRole::Source, "GPIB0::1::INSTR").await?;
/// ```
pub struct MockBackend {
    bench: Mutex<Bench>,
    diode: LaserDiodeModel,
    noise: NoiseModel,
    rng: MockRng,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
    capabilities: HashMap<InstrumentRole, CapabilityFlags>,
    voltage_range: OutputRange,
    current_range: OutputRange,
    unreachable: HashSet<String>,
}

impl MockBackend {
    /// Instant mode, default diode and noise, fixed seed.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MockBackendBuilder {
        MockBackendBuilder::default()
    }

    pub fn diode(&self) -> &LaserDiodeModel {
        &self.diode
    }

    /// Every successful operation after connect, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.bench.lock().calls.clone()
    }

    /// Number of logged operations. Connects are not counted.
    pub fn operation_count(&self) -> usize {
        self.bench.lock().calls.len()
    }

    pub fn connect_count(&self) -> usize {
        self.bench.lock().connects
    }

    /// Handles currently connected.
    pub fn connected_count(&self) -> usize {
        self.bench.lock().connected.len()
    }

    pub fn calls_of(&self, operation: Operation) -> Vec<CallRecord> {
        self.bench
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// `enable_output` calls as `(enabled, time)` pairs.
    pub fn enable_events(&self) -> Vec<(bool, Instant)> {
        self.bench
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c.args {
                CallArgs::Enable(on) if c.operation == Operation::EnableOutput => Some((on, c.at)),
                _ => None,
            })
            .collect()
    }

    pub fn output_enabled(&self) -> bool {
        self.bench.lock().source.enabled
    }

    pub fn output_level(&self) -> f64 {
        self.bench.lock().source.level
    }

    pub fn source_mode(&self) -> SourceMode {
        self.bench.lock().source.mode
    }

    pub fn compliance(&self) -> Option<f64> {
        self.bench.lock().source.compliance
    }

    pub fn pulse(&self) -> Option<PulseTiming> {
        self.bench.lock().source.pulse
    }

    fn range_for(&self, mode: SourceMode) -> OutputRange {
        match mode {
            SourceMode::Voltage => self.voltage_range,
            SourceMode::Current => self.current_range,
        }
    }

    async fn latency(&self, operation: Operation) {
        if !self.mode.has_latency() {
            return;
        }
        let mut delay = self.timing.communication_delay();
        if operation == Operation::Read {
            delay += self.timing.integration_time();
        }
        if self.mode == MockMode::Chaos {
            delay += delay.mul_f64(self.rng.next_f64());
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Confirm the handle is live and run error injection.
    fn checked(&self, handle: &InstrumentHandle, operation: Operation) -> LivResult<InstrumentRole> {
        let role = self
            .bench
            .lock()
            .connected
            .get(&handle.id())
            .copied()
            .ok_or_else(|| {
                LivError::from(DriverError::new(
                    driver_name(handle.role()),
                    DriverErrorKind::Communication,
                    format!("handle {} is not connected", handle.id()),
                ))
            })?;
        self.error_config.check(driver_name(role), operation)?;
        Ok(role)
    }

    fn require_source(role: InstrumentRole, operation: Operation) -> LivResult<()> {
        if role != InstrumentRole::Source {
            return Err(LivError::UnsupportedOperation(format!(
                "{} on {}",
                operation, role
            )));
        }
        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstrumentBackend for MockBackend {
    async fn connect(
        &self,
        role: InstrumentRole,
        identifier: &str,
    ) -> LivResult<InstrumentHandle> {
        self.latency(Operation::Connect).await;
        self.error_config.check(driver_name(role), Operation::Connect)?;

        if identifier.trim().is_empty() || self.unreachable.contains(identifier) {
            return Err(LivError::Connection {
                identifier: identifier.to_string(),
                reason: "no instrument responds at this address".into(),
            });
        }

        let capabilities = self
            .capabilities
            .get(&role)
            .copied()
            .unwrap_or_else(|| default_capabilities(role));

        let mut bench = self.bench.lock();
        let id = bench.next_id;
        bench.next_id += 1;
        bench.connected.insert(id, role);
        bench.connects += 1;
        debug!(id, %role, identifier, "mock instrument connected");

        Ok(InstrumentHandle::new(id, role, identifier, capabilities))
    }

    async fn configure_source(&self, handle: &InstrumentHandle, mode: SourceMode) -> LivResult<()> {
        self.latency(Operation::ConfigureSource).await;
        let role = self.checked(handle, Operation::ConfigureSource)?;
        Self::require_source(role, Operation::ConfigureSource)?;

        let mut bench = self.bench.lock();
        bench.source.mode = mode;
        bench.source.level = 0.0;
        bench.record(handle, Operation::ConfigureSource, CallArgs::Mode(mode));
        Ok(())
    }

    async fn set_compliance(&self, handle: &InstrumentHandle, limit: f64) -> LivResult<()> {
        self.latency(Operation::SetCompliance).await;
        let role = self.checked(handle, Operation::SetCompliance)?;
        if !handle.capabilities().compliance {
            return Err(LivError::UnsupportedOperation(format!(
                "{} on {} without compliance support",
                Operation::SetCompliance,
                role
            )));
        }
        if !(limit.is_finite() && limit > 0.0) {
            return Err(DriverError::new(
                driver_name(role),
                DriverErrorKind::InvalidParameter,
                format!("compliance limit must be positive, got {}", limit),
            )
            .into());
        }

        let mut bench = self.bench.lock();
        bench.source.compliance = Some(limit);
        bench.record(handle, Operation::SetCompliance, CallArgs::Level(limit));
        Ok(())
    }

    async fn set_output(&self, handle: &InstrumentHandle, value: f64) -> LivResult<()> {
        self.latency(Operation::SetOutput).await;
        let role = self.checked(handle, Operation::SetOutput)?;
        Self::require_source(role, Operation::SetOutput)?;

        let mut bench = self.bench.lock();
        let range = self.range_for(bench.source.mode);
        if !(value.is_finite() && range.contains(value)) {
            return Err(LivError::Limit {
                value,
                min: range.min,
                max: range.max,
            });
        }
        bench.source.level = value;
        bench.record(handle, Operation::SetOutput, CallArgs::Level(value));
        Ok(())
    }

    async fn read(&self, handle: &InstrumentHandle) -> LivResult<f64> {
        self.latency(Operation::Read).await;
        let role = self.checked(handle, Operation::Read)?;

        let mut bench = self.bench.lock();
        let source = bench.source;
        let drive = if source.enabled { source.level } else { 0.0 };
        let point = self.diode.operating_point(source.mode, drive);
        let raw = match role {
            InstrumentRole::Source => drive,
            InstrumentRole::Voltmeter => point.voltage,
            InstrumentRole::Ammeter => point.current,
            InstrumentRole::OpticalPowerMeter => point.power,
        };
        let value = self.noise.apply(raw, &self.rng);
        bench.record(handle, Operation::Read, CallArgs::Level(value));
        Ok(value)
    }

    async fn enable_output(&self, handle: &InstrumentHandle, enabled: bool) -> LivResult<()> {
        self.latency(Operation::EnableOutput).await;
        let role = self.checked(handle, Operation::EnableOutput)?;
        Self::require_source(role, Operation::EnableOutput)?;

        let mut bench = self.bench.lock();
        bench.source.enabled = enabled;
        bench.record(handle, Operation::EnableOutput, CallArgs::Enable(enabled));
        Ok(())
    }

    async fn configure_pulse(
        &self,
        handle: &InstrumentHandle,
        width: Duration,
        period: Duration,
    ) -> LivResult<()> {
        self.latency(Operation::ConfigurePulse).await;
        let role = self.checked(handle, Operation::ConfigurePulse)?;
        if !handle.capabilities().pulsing {
            return Err(LivError::UnsupportedOperation(format!(
                "{} on {} without pulsing support",
                Operation::ConfigurePulse,
                role
            )));
        }
        if width.is_zero() || width >= period {
            return Err(DriverError::new(
                driver_name(role),
                DriverErrorKind::InvalidParameter,
                format!("pulse width {:?} does not fit period {:?}", width, period),
            )
            .into());
        }

        let pulse = PulseTiming::new(width, period);
        let mut bench = self.bench.lock();
        bench.source.pulse = Some(pulse);
        bench.record(handle, Operation::ConfigurePulse, CallArgs::Pulse(pulse));
        Ok(())
    }

    async fn disconnect(&self, handle: &InstrumentHandle) -> LivResult<()> {
        self.latency(Operation::Disconnect).await;
        let role = self.checked(handle, Operation::Disconnect)?;

        let mut bench = self.bench.lock();
        bench.record(handle, Operation::Disconnect, CallArgs::None);
        bench.connected.remove(&handle.id());
        if role == InstrumentRole::Source
            && !bench
                .connected
                .values()
                .any(|r| *r == InstrumentRole::Source)
        {
            // Closing the last source leaves the diode unpowered.
            bench.source.enabled = false;
            bench.source.level = 0.0;
        }
        debug!(id = handle.id(), %role, "mock instrument disconnected");
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockBackendBuilder {
    diode: LaserDiodeModel,
    noise: NoiseModel,
    seed: Option<u64>,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
    capabilities: HashMap<InstrumentRole, CapabilityFlags>,
    voltage_range: OutputRange,
    current_range: OutputRange,
    unreachable: HashSet<String>,
}

impl Default for MockBackendBuilder {
    fn default() -> Self {
        Self {
            diode: LaserDiodeModel::default(),
            noise: NoiseModel::default(),
            seed: None,
            mode: MockMode::default(),
            timing: TimingConfig::default(),
            error_config: ErrorConfig::default(),
            capabilities: HashMap::new(),
            voltage_range: OutputRange::symmetric(20.0),
            current_range: OutputRange::symmetric(1.0),
            unreachable: HashSet::new(),
        }
    }
}

impl MockBackendBuilder {
    pub fn diode(mut self, diode: LaserDiodeModel) -> Self {
        self.diode = diode;
        self
    }

    pub fn noise(mut self, noise: NoiseModel) -> Self {
        self.noise = noise;
        self
    }

    /// RNG seed for noise. Defaults to a fixed seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn error_config(mut self, error_config: ErrorConfig) -> Self {
        self.error_config = error_config;
        self
    }

    /// Override the capability flags advertised for a role.
    pub fn capabilities(mut self, role: InstrumentRole, flags: CapabilityFlags) -> Self {
        self.capabilities.insert(role, flags);
        self
    }

    pub fn voltage_range(mut self, range: OutputRange) -> Self {
        self.voltage_range = range;
        self
    }

    pub fn current_range(mut self, range: OutputRange) -> Self {
        self.current_range = range;
        self
    }

    /// Make `connect` fail for this address.
    pub fn unreachable(mut self, identifier: impl Into<String>) -> Self {
        self.unreachable.insert(identifier.into());
        self
    }

    pub fn build(self) -> MockBackend {
        let rng = match self.seed {
            Some(seed) => MockRng::new(Some(seed)),
            None => MockRng::default(),
        };
        MockBackend {
            bench: Mutex::new(Bench::default()),
            diode: self.diode,
            noise: self.noise,
            rng,
            mode: self.mode,
            timing: self.timing,
            error_config: self.error_config,
            capabilities: self.capabilities,
            voltage_range: self.voltage_range,
            current_range: self.current_range,
            unreachable: self.unreachable,
        }
    }
}
