//! Safety guard for compliance limits.
//!
//! The sweep controller consults the guard twice per step:
//! - before applying a setpoint, against the limit of the driven quantity
//! - after sampling, against every measured quantity
//!
//! A violation is not an error. The controller parks the outputs and ends the
//! session in `Aborted` with the [`ViolationReason`].

use crate::config::MeasurementConfig;
use crate::capabilities::SourceMode;
use crate::data::SamplePoint;
use serde::{Deserialize, Serialize};

/// Which limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationReason {
    OverVoltage,
    OverCurrent,
    OverPower,
}

impl std::fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationReason::OverVoltage => write!(f, "over-voltage"),
            ViolationReason::OverCurrent => write!(f, "over-current"),
            ViolationReason::OverPower => write!(f, "over-power"),
        }
    }
}

/// Outcome of a guard check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Verdict {
    Allow,
    Violation(ViolationReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Stateless limit checker.
pub struct SafetyGuard;

impl SafetyGuard {
    /// Check a proposed setpoint and/or the last reading against the limits.
    ///
    /// The setpoint is compared with the limit of the quantity the source
    /// drives. Reading channels are checked in voltage, current, power order
    /// and the first violation wins. Magnitudes are compared so reverse-bias
    /// sweeps are bounded symmetrically.
    pub fn check(
        config: &MeasurementConfig,
        proposed_setpoint: Option<f64>,
        last_reading: Option<&SamplePoint>,
    ) -> Verdict {
        let limits = &config.limits;

        if let Some(setpoint) = proposed_setpoint {
            let mode = config.source_mode();
            if setpoint.abs() > limits.limit_for(mode) {
                return Verdict::Violation(Self::reason_for(mode));
            }
        }

        if let Some(reading) = last_reading {
            if let Some(voltage) = reading.voltage {
                if voltage.abs() > limits.max_voltage {
                    return Verdict::Violation(ViolationReason::OverVoltage);
                }
            }
            if let Some(current) = reading.current {
                if current.abs() > limits.max_current {
                    return Verdict::Violation(ViolationReason::OverCurrent);
                }
            }
            if let (Some(power), Some(max_power)) = (reading.power, limits.max_power) {
                if power > max_power {
                    return Verdict::Violation(ViolationReason::OverPower);
                }
            }
        }

        Verdict::Allow
    }

    /// Check a setpoint before it is applied.
    pub fn pre_check(config: &MeasurementConfig, setpoint: f64) -> Verdict {
        Self::check(config, Some(setpoint), None)
    }

    /// Check the readings taken at a setpoint.
    pub fn post_check(config: &MeasurementConfig, reading: &SamplePoint) -> Verdict {
        Self::check(config, None, Some(reading))
    }

    fn reason_for(mode: SourceMode) -> ViolationReason {
        match mode {
            SourceMode::Voltage => ViolationReason::OverVoltage,
            SourceMode::Current => ViolationReason::OverCurrent,
        }
    }
}
