//! Common infrastructure for the simulated bench.
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **timing**: Hardware-like command latencies
//! - **errors**: Error injection framework
//! - **rng**: Seeded random number generator

pub mod errors;
pub mod mode;
pub mod rng;
pub mod timing;

pub use errors::{ErrorConfig, ErrorScenario, Operation};
pub use mode::MockMode;
pub use rng::MockRng;
pub use timing::TimingConfig;
