//! Simulated instrument bench for liv-daq.
//!
//! Provides [`MockBackend`], a hardware-free implementation of
//! [`InstrumentBackend`](liv_core::InstrumentBackend) built around a simulated
//! laser diode. All waits use `tokio::time`, so tests running on a paused
//! clock observe exact simulated timings.
//!
//! # Simulated device
//!
//! - Turn-on voltage 1.5 V, series resistance 5 Ω
//! - Threshold current 15 mA, slope efficiency 0.8 W/A
//! - 0.1 % + 10 µ-unit bounded uniform reading noise from a seeded RNG
//! - Source range ±20 V / ±1 A
//!
//! # Modes
//!
//! - Instant: zero latency (default)
//! - Realistic: per-command communication delay from [`TimingConfig`]
//! - Chaos: realistic delay with random jitter
//!
//! Failures can be scripted with [`ErrorConfig`].

pub mod backend;
pub mod common;
pub mod diode;

pub use backend::{CallArgs, CallRecord, MockBackend, MockBackendBuilder};
pub use liv_core::capabilities::OutputRange;
pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, Operation, TimingConfig};
pub use diode::{LaserDiodeModel, NoiseModel, OperatingPoint};
