//! Measurement presets saved as JSON.
//!
//! A preset pairs a [`MeasurementConfig`] with the device it was written for,
//! so a bench operator can rerun the same sweep later.

use anyhow::{bail, Context, Result};
use liv_core::{ComplianceLimits, MeasurementConfig, MeasurementKind};
use liv_storage::DeviceInfo;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Version written to new presets and accepted on load.
pub const PRESET_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPreset {
    pub version: String,
    pub device: DeviceInfo,
    pub measurement: MeasurementConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl MeasurementPreset {
    pub fn new(device: DeviceInfo, measurement: MeasurementConfig) -> Self {
        Self {
            version: PRESET_VERSION.to_string(),
            device,
            measurement,
            notes: None,
        }
    }

    /// A CW L-I-V sweep from 0 to 100 mA, suitable as a starting point.
    pub fn template() -> Self {
        let measurement = MeasurementConfig::builder(MeasurementKind::Liv)
            .cw(liv_core::SourceMode::Current)
            .sweep(0.0, 0.1, 0.001)
            .settle_time(Duration::from_millis(10))
            .limits(ComplianceLimits::new(2.5, 0.12).with_max_power(0.1))
            .build();
        let mut preset = Self::new(DeviceInfo::new("unnamed"), measurement);
        preset.notes = Some("Edit sweep and limits for the device under test".into());
        preset
    }

    /// Load and validate a preset file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read preset {}", path.display()))?;
        let preset: MeasurementPreset = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse preset {}", path.display()))?;

        if preset.version != PRESET_VERSION {
            bail!(
                "Unsupported preset version '{}' in {} (expected {})",
                preset.version,
                path.display(),
                PRESET_VERSION
            );
        }
        preset
            .measurement
            .validate()
            .with_context(|| format!("Invalid measurement in {}", path.display()))?;
        Ok(preset)
    }

    /// Write the preset as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write preset {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn template_is_valid_and_survives_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("presets").join("template.json");

        let template = MeasurementPreset::template();
        template.measurement.validate().unwrap();
        template.save(&path).unwrap();

        let loaded = MeasurementPreset::load(&path).unwrap();
        assert_eq!(loaded, template);
    }

    #[test]
    fn durations_are_human_readable() {
        let json = serde_json::to_string(&MeasurementPreset::template()).unwrap();
        assert!(json.contains("\"settle_time\":\"10ms\""), "{}", json);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.json");
        let mut preset = MeasurementPreset::template();
        preset.version = "0.9".into();
        preset.save(&path).unwrap();

        let err = MeasurementPreset::load(&path).unwrap_err();
        assert!(err.to_string().contains("Unsupported preset version"));
    }

    #[test]
    fn invalid_measurement_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let mut preset = MeasurementPreset::template();
        preset.measurement.sweep.step = -0.001;
        preset.save(&path).unwrap();

        assert!(MeasurementPreset::load(&path).is_err());
    }
}
