//! Core types and traits for the liv-daq acquisition engine.
//!
//! - [`capabilities`]: the instrument backend trait and handle types
//! - [`config`]: measurement configuration and validation
//! - [`data`]: sample rows produced by a sweep
//! - [`limits`]: the safety guard consulted before and after every step
//! - [`error`]: the error taxonomy shared by every crate in the workspace

pub mod capabilities;
pub mod config;
pub mod data;
pub mod error;
pub mod limits;

pub use capabilities::{
    CapabilityFlags, InstrumentBackend, InstrumentHandle, InstrumentRole, OutputRange, SourceMode,
};
pub use config::{
    ComplianceLimits, MeasurementConfig, MeasurementConfigBuilder, MeasurementKind, PulseTiming,
    Regime, SweepRange,
};
pub use data::SamplePoint;
pub use error::{DriverError, DriverErrorKind, LivError, LivResult};
pub use limits::{SafetyGuard, Verdict, ViolationReason};
