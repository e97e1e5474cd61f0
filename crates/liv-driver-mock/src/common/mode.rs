//! Operational modes for the simulated bench.
//!
//! - **Instant**: Zero latency, for unit tests and paused-clock timing tests
//! - **Realistic**: Every command pays the configured communication delay
//! - **Chaos**: Realistic delays plus random jitter of up to one extra delay

/// Operational modes for mock instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays - for unit tests
    #[default]
    Instant,
    /// Instrument-like latency - for integration tests
    Realistic,
    /// Jittered latency - for timing robustness tests
    Chaos,
}

impl MockMode {
    /// True when commands should sleep before completing.
    pub fn has_latency(&self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}
