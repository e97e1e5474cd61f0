//! Error injection for the simulated bench.
//!
//! Failures are mapped onto [`LivError::Driver`] so the sweep controller sees
//! exactly what a real instrument fault would produce.

use super::rng::MockRng;
use liv_core::error::{DriverError, DriverErrorKind, LivError, LivResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Backend operation, as seen by error injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    ConfigureSource,
    SetCompliance,
    SetOutput,
    Read,
    EnableOutput,
    ConfigurePulse,
    Disconnect,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::ConfigureSource => "configure_source",
            Operation::SetCompliance => "set_compliance",
            Operation::SetOutput => "set_output",
            Operation::Read => "read",
            Operation::EnableOutput => "enable_output",
            Operation::ConfigurePulse => "configure_pulse",
            Operation::Disconnect => "disconnect",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scripted failure.
#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Let `count` calls of `operation` succeed, fail every later one
    FailAfterN { operation: Operation, count: u32 },
    /// Every call of `operation` times out
    Timeout { operation: Operation },
    /// The first checked call loses the link and every later call fails
    CommunicationLoss,
    /// The first checked call latches a hardware fault code
    HardwareFault { code: u32 },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<Operation, u32>,
    communication_lost: bool,
    hardware_fault_code: u32,
}

/// Error injection configuration shared by every handle of one backend.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    failure_rates: Arc<HashMap<Operation, f64>>,
    default_rate: f64,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

impl ErrorConfig {
    /// No injected errors (default)
    pub fn none() -> Self {
        Self {
            failure_rates: Arc::new(HashMap::new()),
            default_rate: 0.0,
            scenarios: Arc::new(Vec::new()),
            rng: Arc::new(MockRng::default()),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Uniform random failures on every operation.
    pub fn random_failures_seeded(rate: f64, seed: u64) -> Self {
        Self {
            default_rate: rate,
            rng: Arc::new(MockRng::new(Some(seed))),
            ..Self::none()
        }
    }

    /// Per-operation failure rates.
    pub fn with_rates(rates: HashMap<Operation, f64>) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            ..Self::none()
        }
    }

    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self {
            scenarios: Arc::new(scenarios),
            ..Self::none()
        }
    }

    /// Decide whether `operation` on `instrument` fails this time.
    pub fn check(&self, instrument: &str, operation: Operation) -> LivResult<()> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(Self::fault(
                instrument,
                DriverErrorKind::Communication,
                "communication lost",
            ));
        }
        if state.hardware_fault_code != 0 {
            return Err(Self::fault(
                instrument,
                DriverErrorKind::Hardware,
                format!("hardware fault {}", state.hardware_fault_code),
            ));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN { operation: op, count } if *op == operation => {
                    let seen = state.operation_counts.entry(operation).or_insert(0);
                    *seen += 1;
                    if *seen > *count {
                        return Err(Self::fault(
                            instrument,
                            DriverErrorKind::Hardware,
                            format!("injected failure on {} after {} calls", operation, count),
                        ));
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(Self::fault(
                        instrument,
                        DriverErrorKind::Timeout,
                        format!("{} timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(Self::fault(
                        instrument,
                        DriverErrorKind::Communication,
                        "communication lost",
                    ));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(Self::fault(
                        instrument,
                        DriverErrorKind::Hardware,
                        format!("hardware fault {}", code),
                    ));
                }
                _ => {}
            }
        }
        drop(state);

        let rate = self
            .failure_rates
            .get(&operation)
            .copied()
            .unwrap_or(self.default_rate);
        if self.rng.should_fail(rate) {
            return Err(Self::fault(
                instrument,
                DriverErrorKind::Hardware,
                format!("random failure on {}", operation),
            ));
        }

        Ok(())
    }

    /// Clear counters and latched faults.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }

    fn fault(instrument: &str, kind: DriverErrorKind, message: impl Into<String>) -> LivError {
        DriverError::new(instrument, kind, message).into()
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(result: LivResult<()>) -> Option<DriverErrorKind> {
        match result {
            Err(LivError::Driver(e)) => Some(e.kind),
            _ => None,
        }
    }

    #[test]
    fn test_no_errors() {
        let config = ErrorConfig::none();
        for _ in 0..100 {
            assert!(config.check("mock_source", Operation::Read).is_ok());
        }
    }

    #[test]
    fn test_random_failures() {
        let config = ErrorConfig::random_failures_seeded(0.5, 42);
        let failures = (0..1000)
            .filter(|_| config.check("mock_source", Operation::Read).is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn test_fail_after_n() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: Operation::SetOutput,
            count: 3,
        });
        for _ in 0..3 {
            assert!(config.check("mock_source", Operation::SetOutput).is_ok());
        }
        assert_eq!(
            kind_of(config.check("mock_source", Operation::SetOutput)),
            Some(DriverErrorKind::Hardware)
        );
        // Other operations are unaffected
        assert!(config.check("mock_source", Operation::Read).is_ok());
    }

    #[test]
    fn test_timeout_scenario() {
        let config = ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: Operation::Read,
        });
        assert_eq!(
            kind_of(config.check("mock_meter", Operation::Read)),
            Some(DriverErrorKind::Timeout)
        );
        assert!(config.check("mock_meter", Operation::SetOutput).is_ok());
    }

    #[test]
    fn test_communication_loss_latches() {
        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        assert_eq!(
            kind_of(config.check("mock_source", Operation::Read)),
            Some(DriverErrorKind::Communication)
        );
        assert!(config.check("mock_source", Operation::EnableOutput).is_err());
    }

    #[test]
    fn test_hardware_fault_code_in_message() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 0x42 });
        match config.check("mock_source", Operation::Read) {
            Err(LivError::Driver(e)) => assert!(e.message.contains("66")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_reset_clears_counters() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: Operation::Read,
            count: 1,
        });
        assert!(config.check("m", Operation::Read).is_ok());
        assert!(config.check("m", Operation::Read).is_err());
        config.reset();
        assert!(config.check("m", Operation::Read).is_ok());
    }

    #[test]
    fn test_custom_rates() {
        let mut rates = HashMap::new();
        rates.insert(Operation::Read, 1.0);
        rates.insert(Operation::SetOutput, 0.0);
        let config = ErrorConfig::with_rates(rates);
        for _ in 0..10 {
            assert!(config.check("m", Operation::Read).is_err());
            assert!(config.check("m", Operation::SetOutput).is_ok());
        }
    }
}
