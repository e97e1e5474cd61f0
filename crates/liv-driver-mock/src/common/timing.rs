//! Command latencies for realistic mode.

use std::time::Duration;

/// Per-command latencies applied outside [`MockMode::Instant`](super::MockMode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Round-trip time of every command (GPIB/USB/LAN)
    pub communication_delay_ms: u64,
    /// Extra time a reading takes to integrate
    pub integration_time_ms: u64,
}

impl TimingConfig {
    /// GPIB source/measure unit, e.g. a Keithley 24xx.
    pub fn source_measure_unit() -> Self {
        Self {
            communication_delay_ms: 2,
            integration_time_ms: 1,
        }
    }

    /// USB/LAN oscilloscope used as a photodetector readout.
    pub fn oscilloscope() -> Self {
        Self {
            communication_delay_ms: 5,
            integration_time_ms: 10,
        }
    }

    pub fn communication_delay(&self) -> Duration {
        Duration::from_millis(self.communication_delay_ms)
    }

    pub fn integration_time(&self) -> Duration {
        Duration::from_millis(self.integration_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing_is_zero() {
        let config = TimingConfig::default();
        assert_eq!(config.communication_delay(), Duration::ZERO);
        assert_eq!(config.integration_time(), Duration::ZERO);
    }

    #[test]
    fn test_presets() {
        assert_eq!(
            TimingConfig::source_measure_unit().communication_delay(),
            Duration::from_millis(2)
        );
        assert_eq!(
            TimingConfig::oscilloscope().integration_time(),
            Duration::from_millis(10)
        );
    }
}
