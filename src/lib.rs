//! liv-daq: laser-diode L-I-V acquisition.
//!
//! The engine lives in the workspace crates:
//!
//! - [`liv_core`]: configuration, safety limits, the instrument trait
//! - [`liv_driver_mock`]: a simulated bench with a diode model
//! - [`liv_experiment`]: the sweep controller and session state
//! - [`liv_storage`]: CSV export with a JSON metadata header
//!
//! This crate adds the launcher pieces: bench configuration, presets,
//! tracing setup and an SCPI backend for real instruments.

pub mod bench;
pub mod config;
pub mod presets;
pub mod scpi;
pub mod tracing_init;

pub use bench::{build_backend, connect_instruments, run_preset, RunReport};
pub use config::BenchConfig;
pub use presets::MeasurementPreset;
pub use scpi::ScpiBackend;

pub use liv_core;
pub use liv_driver_mock;
pub use liv_experiment;
pub use liv_storage;
