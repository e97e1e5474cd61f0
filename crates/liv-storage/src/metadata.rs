//! Metadata written ahead of the sample table.

use chrono::{DateTime, Utc};
use liv_core::config::MeasurementConfig;
use liv_experiment::session::{SessionSnapshot, SessionState, TerminalReason};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Version tag of the export layout.
pub const EXPORT_FORMAT_VERSION: &str = "1.0";

/// Fractional digits written for every numeric column.
pub const EXPORT_PRECISION: usize = 9;

/// Device under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceInfo {
    pub name: String,
    /// Free-form die or package dimensions, e.g. `"300x4 um"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<String>,
    /// Heat-sink temperature in degrees Celsius.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    /// Marks runs on a reference laser rather than a production device.
    #[serde(default)]
    pub test_laser: bool,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub format_version: String,
    pub session_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
    pub config: MeasurementConfig,
    pub state: SessionState,
    #[serde(default)]
    pub reason: Option<TerminalReason>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub exported_at: DateTime<Utc>,
    pub sample_count: usize,
    pub precision: usize,
}

impl ExportMetadata {
    pub fn from_snapshot(snapshot: &SessionSnapshot, device: Option<&DeviceInfo>) -> Self {
        Self {
            format_version: EXPORT_FORMAT_VERSION.to_string(),
            session_id: snapshot.id,
            device: device.cloned(),
            config: (*snapshot.config).clone(),
            state: snapshot.state,
            reason: snapshot.reason.clone(),
            started_at: snapshot.started_at,
            exported_at: Utc::now(),
            sample_count: snapshot.samples.len(),
            precision: EXPORT_PRECISION,
        }
    }
}
