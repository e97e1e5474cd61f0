//! Measurement configuration.
//!
//! A [`MeasurementConfig`] is an immutable value describing one sweep: what
//! is measured, how the diode is driven, the setpoint range, timing and the
//! compliance limits the safety guard enforces. It is validated once, before
//! the session contacts any instrument.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = MeasurementConfig::builder(MeasurementKind::Liv)
//!     .cw(SourceMode::Current)
//!     .sweep(0.0, 0.05, 0.001)
//!     .settle_time(Duration::from_millis(20))
//!     .limits(ComplianceLimits::new(3.0, 0.06))
//!     .build();
//! config.validate()?;
//! ```

use crate::capabilities::{InstrumentRole, SourceMode};
use crate::error::{LivError, LivResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the number of setpoints a single sweep may produce.
pub const MAX_SWEEP_POINTS: usize = 100_000;

/// Skew bound used when the settle time is zero and no explicit bound is set.
pub const MIN_DEFAULT_SKEW: Duration = Duration::from_millis(1);

/// Relative tolerance when deciding whether the step divides the span evenly.
const STEP_RATIO_EPSILON: f64 = 1e-9;

// =============================================================================
// MeasurementKind
// =============================================================================

/// Which curve the sweep produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementKind {
    /// Optical power and voltage against current.
    Liv,
    /// Voltage against current.
    Iv,
    /// Optical power against drive.
    Li,
}

impl MeasurementKind {
    /// Instrument roles that must be connected before a sweep can start.
    pub fn required_roles(&self) -> &'static [InstrumentRole] {
        match self {
            MeasurementKind::Liv => &[
                InstrumentRole::Source,
                InstrumentRole::Voltmeter,
                InstrumentRole::Ammeter,
                InstrumentRole::OpticalPowerMeter,
            ],
            MeasurementKind::Iv => &[
                InstrumentRole::Source,
                InstrumentRole::Voltmeter,
                InstrumentRole::Ammeter,
            ],
            MeasurementKind::Li => &[InstrumentRole::Source, InstrumentRole::OpticalPowerMeter],
        }
    }

    /// True when the kind records optical power.
    pub fn measures_power(&self) -> bool {
        matches!(self, MeasurementKind::Liv | MeasurementKind::Li)
    }

    /// True when dedicated voltmeter and ammeter channels are sampled.
    pub fn measures_electrical(&self) -> bool {
        matches!(self, MeasurementKind::Liv | MeasurementKind::Iv)
    }
}

impl std::fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasurementKind::Liv => write!(f, "L-I-V"),
            MeasurementKind::Iv => write!(f, "I-V"),
            MeasurementKind::Li => write!(f, "L-I"),
        }
    }
}

// =============================================================================
// Regime
// =============================================================================

/// Pulse width and repetition period for pulsed regimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseTiming {
    #[serde(with = "humantime_serde")]
    pub width: Duration,
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

impl PulseTiming {
    pub fn new(width: Duration, period: Duration) -> Self {
        Self { width, period }
    }

    /// Fraction of each period the output is enabled.
    pub fn duty_cycle(&self) -> f64 {
        if self.period.is_zero() {
            return 0.0;
        }
        self.width.as_secs_f64() / self.period.as_secs_f64()
    }
}

/// How the diode is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Regime {
    /// Continuous-wave: output stays enabled for the whole sweep.
    Cw { source: SourceMode },
    /// Voltage pulses of fixed width and period.
    VoltagePulsed { pulse: PulseTiming },
    /// Current pulses of fixed width and period.
    CurrentPulsed { pulse: PulseTiming },
}

impl Regime {
    /// Quantity the source drives. Pulsed regimes fix it.
    pub fn source_mode(&self) -> SourceMode {
        match self {
            Regime::Cw { source } => *source,
            Regime::VoltagePulsed { .. } => SourceMode::Voltage,
            Regime::CurrentPulsed { .. } => SourceMode::Current,
        }
    }

    pub fn pulse(&self) -> Option<PulseTiming> {
        match self {
            Regime::Cw { .. } => None,
            Regime::VoltagePulsed { pulse } | Regime::CurrentPulsed { pulse } => Some(*pulse),
        }
    }

    pub fn is_pulsed(&self) -> bool {
        self.pulse().is_some()
    }
}

// =============================================================================
// SweepRange and limits
// =============================================================================

/// Setpoint range in drive units (V or A).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl SweepRange {
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        Self { start, stop, step }
    }

    /// Number of setpoints the sweep visits, endpoint included.
    ///
    /// Assumes a validated range. A step that does not divide the span
    /// evenly adds one final point clamped to `stop`.
    pub fn point_count(&self) -> usize {
        if self.start == self.stop {
            return 1;
        }
        let ratio = ((self.stop - self.start) / self.step).abs();
        let rounded = ratio.round();
        let intervals = if (ratio - rounded).abs() <= STEP_RATIO_EPSILON * ratio.max(1.0) {
            rounded
        } else {
            ratio.ceil()
        };
        (intervals as usize).saturating_add(1)
    }
}

/// Configured limits the safety guard enforces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplianceLimits {
    /// Volts.
    pub max_voltage: f64,
    /// Amperes.
    pub max_current: f64,
    /// Watts. Unchecked when absent.
    #[serde(default)]
    pub max_power: Option<f64>,
}

impl ComplianceLimits {
    pub fn new(max_voltage: f64, max_current: f64) -> Self {
        Self {
            max_voltage,
            max_current,
            max_power: None,
        }
    }

    pub fn with_max_power(mut self, max_power: f64) -> Self {
        self.max_power = Some(max_power);
        self
    }

    /// Limit on the quantity the source drives.
    pub fn limit_for(&self, mode: SourceMode) -> f64 {
        match mode {
            SourceMode::Voltage => self.max_voltage,
            SourceMode::Current => self.max_current,
        }
    }

    /// Limit on the quantity the source does not drive, used as hardware
    /// compliance.
    pub fn compliance_for(&self, mode: SourceMode) -> f64 {
        match mode {
            SourceMode::Voltage => self.max_current,
            SourceMode::Current => self.max_voltage,
        }
    }
}

impl Default for ComplianceLimits {
    fn default() -> Self {
        Self::new(5.0, 0.1)
    }
}

// =============================================================================
// MeasurementConfig
// =============================================================================

/// Complete description of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    pub kind: MeasurementKind,
    pub regime: Regime,
    pub sweep: SweepRange,
    /// Wait between applying a setpoint and sampling.
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    pub limits: ComplianceLimits,
    /// Largest tolerated spread between the first and last channel read of a
    /// step. Defaults to the settle time.
    #[serde(default, with = "humantime_serde")]
    pub max_channel_skew: Option<Duration>,
}

impl MeasurementConfig {
    pub fn builder(kind: MeasurementKind) -> MeasurementConfigBuilder {
        MeasurementConfigBuilder::new(kind)
    }

    pub fn source_mode(&self) -> SourceMode {
        self.regime.source_mode()
    }

    pub fn pulse(&self) -> Option<PulseTiming> {
        self.regime.pulse()
    }

    /// Skew bound in force for this sweep.
    ///
    /// An explicit `max_channel_skew` wins. Otherwise the settle time is used,
    /// floored at [`MIN_DEFAULT_SKEW`].
    pub fn effective_max_skew(&self) -> Duration {
        self.max_channel_skew
            .unwrap_or_else(|| self.settle_time.max(MIN_DEFAULT_SKEW))
    }

    /// Check every invariant. Called before any instrument contact.
    pub fn validate(&self) -> LivResult<()> {
        let SweepRange { start, stop, step } = self.sweep;

        if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
            return Err(LivError::Config(format!(
                "sweep values must be finite (start={}, stop={}, step={})",
                start, stop, step
            )));
        }
        if step == 0.0 {
            return Err(LivError::Config("sweep step must be non-zero".into()));
        }
        if start != stop && step.signum() != (stop - start).signum() {
            return Err(LivError::Config(format!(
                "sweep step {} does not point from start {} towards stop {}",
                step, start, stop
            )));
        }
        let ratio = ((stop - start) / step).abs();
        if !(ratio.is_finite() && ratio <= MAX_SWEEP_POINTS as f64) {
            return Err(LivError::Config(format!(
                "sweep from {} to {} in steps of {} exceeds {} points",
                start, stop, step, MAX_SWEEP_POINTS
            )));
        }
        let points = self.sweep.point_count();
        if points > MAX_SWEEP_POINTS {
            return Err(LivError::Config(format!(
                "sweep would produce {} points, maximum is {}",
                points, MAX_SWEEP_POINTS
            )));
        }

        let limits = &self.limits;
        for (name, value) in [
            ("max_voltage", limits.max_voltage),
            ("max_current", limits.max_current),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(LivError::Config(format!(
                    "{} must be a positive finite value, got {}",
                    name, value
                )));
            }
        }
        if let Some(max_power) = limits.max_power {
            if !(max_power.is_finite() && max_power > 0.0) {
                return Err(LivError::Config(format!(
                    "max_power must be a positive finite value, got {}",
                    max_power
                )));
            }
        }

        if let Some(pulse) = self.pulse() {
            if pulse.width.is_zero() {
                return Err(LivError::Config("pulse width must be non-zero".into()));
            }
            if pulse.width >= pulse.period {
                return Err(LivError::Config(format!(
                    "pulse width {:?} must be shorter than period {:?}",
                    pulse.width, pulse.period
                )));
            }
        }

        if let Some(skew) = self.max_channel_skew {
            if skew.is_zero() {
                return Err(LivError::Config("max_channel_skew must be non-zero".into()));
            }
        }

        Ok(())
    }
}

/// Builder for [`MeasurementConfig`].
///
/// Defaults: CW current drive, a single point at zero, no settle time and
/// [`ComplianceLimits::default`]. `build` does not validate.
#[derive(Debug, Clone)]
pub struct MeasurementConfigBuilder {
    kind: MeasurementKind,
    regime: Regime,
    sweep: SweepRange,
    settle_time: Duration,
    limits: ComplianceLimits,
    max_channel_skew: Option<Duration>,
}

impl MeasurementConfigBuilder {
    pub fn new(kind: MeasurementKind) -> Self {
        Self {
            kind,
            regime: Regime::Cw {
                source: SourceMode::Current,
            },
            sweep: SweepRange::new(0.0, 0.0, 1.0),
            settle_time: Duration::ZERO,
            limits: ComplianceLimits::default(),
            max_channel_skew: None,
        }
    }

    pub fn regime(mut self, regime: Regime) -> Self {
        self.regime = regime;
        self
    }

    pub fn cw(self, source: SourceMode) -> Self {
        self.regime(Regime::Cw { source })
    }

    pub fn voltage_pulsed(self, width: Duration, period: Duration) -> Self {
        self.regime(Regime::VoltagePulsed {
            pulse: PulseTiming::new(width, period),
        })
    }

    pub fn current_pulsed(self, width: Duration, period: Duration) -> Self {
        self.regime(Regime::CurrentPulsed {
            pulse: PulseTiming::new(width, period),
        })
    }

    pub fn sweep(mut self, start: f64, stop: f64, step: f64) -> Self {
        self.sweep = SweepRange::new(start, stop, step);
        self
    }

    pub fn settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    pub fn limits(mut self, limits: ComplianceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn max_channel_skew(mut self, skew: Duration) -> Self {
        self.max_channel_skew = Some(skew);
        self
    }

    pub fn build(self) -> MeasurementConfig {
        MeasurementConfig {
            kind: self.kind,
            regime: self.regime,
            sweep: self.sweep,
            settle_time: self.settle_time,
            limits: self.limits,
            max_channel_skew: self.max_channel_skew,
        }
    }
}
