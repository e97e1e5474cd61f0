//! Bench configuration using Figment.
//!
//! Loaded from a TOML file (default `config/bench.toml`) merged with
//! environment variables prefixed `LIV_DAQ_`. Nested keys are separated by a
//! double underscore:
//!
//! ```text
//! LIV_DAQ_APPLICATION__LOG_LEVEL=debug
//! LIV_DAQ_INSTRUMENTS__SOURCE=TCPIP0::192.168.1.20::5025::SOCKET
//! ```
//!
//! The simulated bench is selected by `mock = true` in the file or by the
//! `MOCK_INSTRUMENTS` environment toggle, which wins when set.
//!
//! # Example
//! ```no_run
//! use liv_daq::config::BenchConfig;
//!
//! let config = BenchConfig::load().unwrap();
//! config.validate().unwrap();
//! println!("mock bench: {}", config.use_mock());
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use liv_core::{InstrumentRole, LivError, LivResult, MeasurementKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/bench.toml";

/// Environment toggle selecting the simulated bench.
pub const MOCK_ENV_VAR: &str = "MOCK_INSTRUMENTS";

const ENV_PREFIX: &str = "LIV_DAQ_";

/// Top-level bench configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BenchConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Use the simulated bench instead of real instruments.
    #[serde(default)]
    pub mock: bool,
    #[serde(default)]
    pub instruments: InstrumentAddresses,
    #[serde(default)]
    pub scpi: ScpiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Connection address of each instrument role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InstrumentAddresses {
    pub source: Option<String>,
    pub voltmeter: Option<String>,
    pub ammeter: Option<String>,
    pub optical_power_meter: Option<String>,
}

/// SCPI transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScpiConfig {
    /// Per-command timeout
    #[serde(default = "default_scpi_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Source supports timed pulses (PULS:WIDT / PULS:PER)
    #[serde(default)]
    pub source_pulsing: bool,
    /// Source hardware range in volts, symmetric about zero
    #[serde(default = "default_voltage_range")]
    pub voltage_range: f64,
    /// Source hardware range in amperes, symmetric about zero
    #[serde(default = "default_current_range")]
    pub current_range: f64,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory for exported sessions
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_scpi_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_voltage_range() -> f64 {
    crate::scpi::DEFAULT_VOLTAGE_RANGE
}

fn default_current_range() -> f64 {
    crate::scpi::DEFAULT_CURRENT_RANGE
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for ScpiConfig {
    fn default() -> Self {
        Self {
            timeout: default_scpi_timeout(),
            source_pulsing: false,
            voltage_range: default_voltage_range(),
            current_range: default_current_range(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl InstrumentAddresses {
    pub fn get(&self, role: InstrumentRole) -> Option<&str> {
        match role {
            InstrumentRole::Source => self.source.as_deref(),
            InstrumentRole::Voltmeter => self.voltmeter.as_deref(),
            InstrumentRole::Ammeter => self.ammeter.as_deref(),
            InstrumentRole::OpticalPowerMeter => self.optical_power_meter.as_deref(),
        }
    }
}

impl BenchConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path. A missing file leaves the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(BenchConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.scpi.timeout.is_zero() {
            return Err("scpi.timeout must be non-zero".to_string());
        }

        for (name, range) in [
            ("scpi.voltage_range", self.scpi.voltage_range),
            ("scpi.current_range", self.scpi.current_range),
        ] {
            if !(range.is_finite() && range > 0.0) {
                return Err(format!("{} must be positive, got {}", name, range));
            }
        }

        for role in InstrumentRole::ALL {
            if let Some(address) = self.instruments.get(role) {
                if address.trim().is_empty() {
                    return Err(format!("Empty address for the {} instrument", role));
                }
            }
        }

        Ok(())
    }

    /// Whether to run against the simulated bench.
    ///
    /// `MOCK_INSTRUMENTS` decides when it holds a recognised value, otherwise
    /// the `mock` key does.
    pub fn use_mock(&self) -> bool {
        let env = std::env::var(MOCK_ENV_VAR).ok();
        mock_toggle(env.as_deref()).unwrap_or(self.mock)
    }

    /// Address of every instrument `kind` needs, in connection order.
    ///
    /// The simulated bench accepts any address, so missing entries are filled
    /// with placeholders when `mock` is set. Real benches fail with
    /// `MissingInstrument` for the first role without an address.
    pub fn addresses_for(
        &self,
        kind: MeasurementKind,
        mock: bool,
    ) -> LivResult<Vec<(InstrumentRole, String)>> {
        kind.required_roles()
            .iter()
            .map(|&role| match self.instruments.get(role) {
                Some(address) => Ok((role, address.to_string())),
                None if mock => Ok((role, format!("mock::{:?}", role).to_lowercase())),
                None => Err(LivError::MissingInstrument { role, kind }),
            })
            .collect()
    }
}

/// Interpret a `MOCK_INSTRUMENTS` value.
pub fn mock_toggle(value: Option<&str>) -> Option<bool> {
    match value?.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
