//! Sweep orchestration for liv-daq.
//!
//! - [`plans`]: setpoint generation
//! - [`instruments`]: the owned set of connected instruments
//! - [`session`]: session state, samples, snapshots and events
//! - [`run_engine`]: the sweep controller and its control handle

pub mod instruments;
pub mod plans;
pub mod run_engine;
pub mod session;

pub use instruments::InstrumentSet;
pub use plans::SetpointPlan;
pub use run_engine::{SessionHandle, SweepController};
pub use session::{
    MeasurementSession, SessionEvent, SessionSnapshot, SessionState, SessionStatus,
    TerminalReason,
};
