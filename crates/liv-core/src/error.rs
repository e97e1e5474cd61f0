//! Error types for the acquisition engine.
//!
//! `LivError` is the single error type returned by instrument backends, the
//! sweep controller and the export layer. It is built with `thiserror` so the
//! `?` operator converts underlying I/O and driver errors automatically.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: the measurement configuration failed validation. Raised by
//!   `MeasurementConfig::validate` before any instrument is contacted.
//! - **`MissingInstrument`**: the connected instrument set does not cover the
//!   channels the measurement kind needs.
//! - **`Connection`**: an instrument address could not be reached.
//! - **`Limit`**: a setpoint lies outside the instrument's own hardware range.
//!   This is distinct from the configured compliance limits, which are
//!   enforced by the safety guard and never surface as errors.
//! - **`UnsupportedOperation`**: the handle lacks the capability the call needs
//!   (pulsing, compliance).
//! - **`Driver`**: any other fault reported by a backend (communication loss,
//!   timeouts, hardware faults).
//!
//! Safety violations and user cancellation are not errors: the sweep
//! controller turns them into an `Aborted` session state.

use crate::capabilities::InstrumentRole;
use crate::config::MeasurementKind;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Communication,
    Hardware,
    Timeout,
    InvalidParameter,
    InvalidResponse,
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::InvalidResponse => "invalid_response",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Fault reported by a specific backend driver.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the engine error type.
pub type LivResult<T> = std::result::Result<T, LivError>;

/// Primary error type for the acquisition engine.
#[derive(Error, Debug)]
pub enum LivError {
    /// Measurement configuration failed validation.
    ///
    /// **Error Type**: Permanent - the configuration must be fixed.
    #[error("Configuration validation error: {0}")]
    Config(String),

    /// The instrument set does not cover a channel the measurement needs.
    #[error("{kind} measurement requires a {role} instrument, none connected")]
    MissingInstrument {
        role: InstrumentRole,
        kind: MeasurementKind,
    },

    /// Instrument address unreachable.
    #[error("Connection to '{identifier}' failed: {reason}")]
    Connection { identifier: String, reason: String },

    /// Setpoint outside the instrument's hardware range.
    #[error("Setpoint {value} outside instrument range [{min}, {max}]")]
    Limit { value: f64, min: f64, max: f64 },

    /// The handle does not advertise the capability this call needs.
    #[error("Instrument does not support operation: {0}")]
    UnsupportedOperation(String),

    /// Structured driver error with category
    #[error("{0}")]
    Driver(#[from] DriverError),

    /// A control request arrived in a state that cannot honour it.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or parsing of stored data failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LivError {
    /// True when the error came from an instrument rather than from the
    /// caller's configuration or from local storage.
    pub fn is_instrument_fault(&self) -> bool {
        matches!(
            self,
            LivError::Connection { .. }
                | LivError::Limit { .. }
                | LivError::UnsupportedOperation(_)
                | LivError::Driver(_)
        )
    }
}

impl From<serde_json::Error> for LivError {
    fn from(err: serde_json::Error) -> Self {
        LivError::Serialization(err.to_string())
    }
}
