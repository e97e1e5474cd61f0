//! CSV writer and reader for session snapshots.

use crate::metadata::{DeviceInfo, ExportMetadata, EXPORT_PRECISION};
use chrono::{DateTime, SecondsFormat, Utc};
use liv_core::config::MeasurementKind;
use liv_core::data::SamplePoint;
use liv_core::error::{LivError, LivResult};
use liv_experiment::session::SessionSnapshot;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const COLUMNS: [&str; 9] = [
    "index",
    "setpoint",
    "source_feedback",
    "voltage",
    "current",
    "power",
    "elapsed_s",
    "channel_skew_s",
    "timestamp",
];

/// Writes session snapshots into an output directory, one file per export.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    output_dir: PathBuf,
    device: Option<DeviceInfo>,
}

impl CsvExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            device: None,
        }
    }

    /// Record the device under test in every exported header.
    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = Some(device);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Export `snapshot` to a new timestamped file and return its path.
    pub fn export(&self, snapshot: &SessionSnapshot) -> LivResult<PathBuf> {
        let kind = match snapshot.config.kind {
            MeasurementKind::Liv => "liv",
            MeasurementKind::Iv => "iv",
            MeasurementKind::Li => "li",
        };
        let id = snapshot.id.simple().to_string();
        let file_name = format!(
            "{}_{}_{}.csv",
            kind,
            Utc::now().format("%Y%m%d_%H%M%S"),
            &id[..8]
        );
        let path = self.output_dir.join(file_name);
        export_session(&path, snapshot, self.device.as_ref())?;
        Ok(path)
    }
}

/// Write `snapshot` to `path`, creating parent directories as needed.
pub fn export_session(
    path: &Path,
    snapshot: &SessionSnapshot,
    device: Option<&DeviceInfo>,
) -> LivResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    let mut out = BufWriter::new(file);
    write_session(&mut out, snapshot, device)?;
    out.flush()?;
    info!(
        path = %path.display(),
        samples = snapshot.samples.len(),
        state = %snapshot.state,
        "session exported"
    );
    Ok(())
}

/// Write the metadata header and sample table to `out`.
pub fn write_session<W: Write>(
    mut out: W,
    snapshot: &SessionSnapshot,
    device: Option<&DeviceInfo>,
) -> LivResult<()> {
    let metadata = ExportMetadata::from_snapshot(snapshot, device);
    let json = serde_json::to_string_pretty(&metadata)?;
    for line in json.lines() {
        writeln!(out, "# {}", line)?;
    }

    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(COLUMNS).map_err(csv_error)?;
    for sample in &snapshot.samples {
        writer.write_record(row(sample)).map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

/// Parse a file written by [`export_session`].
pub fn read_session(path: &Path) -> LivResult<(ExportMetadata, Vec<SamplePoint>)> {
    read_session_from(BufReader::new(File::open(path)?))
}

/// Parse an export from any reader.
pub fn read_session_from<R: BufRead>(reader: R) -> LivResult<(ExportMetadata, Vec<SamplePoint>)> {
    let mut json = String::new();
    let mut table = String::new();
    let mut in_header = true;

    for line in reader.lines() {
        let line = line?;
        if in_header {
            if let Some(rest) = line.strip_prefix('#') {
                json.push_str(rest.strip_prefix(' ').unwrap_or(rest));
                json.push('\n');
                continue;
            }
            in_header = false;
        }
        table.push_str(&line);
        table.push('\n');
    }

    if json.trim().is_empty() {
        return Err(LivError::Serialization(
            "export has no metadata header".into(),
        ));
    }
    let metadata: ExportMetadata = serde_json::from_str(&json)?;
    let samples = parse_table(table.as_bytes())?;
    Ok((metadata, samples))
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    index: usize,
    setpoint: f64,
    source_feedback: f64,
    voltage: Option<f64>,
    current: Option<f64>,
    power: Option<f64>,
    elapsed_s: f64,
    channel_skew_s: f64,
    timestamp: DateTime<Utc>,
}

fn parse_table<R: Read>(input: R) -> LivResult<Vec<SamplePoint>> {
    let mut reader = csv::Reader::from_reader(input);
    let mut samples = Vec::new();
    for record in reader.deserialize::<CsvRow>() {
        let row = record.map_err(csv_error)?;
        samples.push(SamplePoint {
            index: row.index,
            setpoint: row.setpoint,
            source_feedback: row.source_feedback,
            voltage: row.voltage,
            current: row.current,
            power: row.power,
            elapsed: seconds(row.elapsed_s, "elapsed_s")?,
            timestamp: row.timestamp,
            channel_skew: seconds(row.channel_skew_s, "channel_skew_s")?,
        });
    }
    Ok(samples)
}

fn row(sample: &SamplePoint) -> [String; 9] {
    [
        sample.index.to_string(),
        number(sample.setpoint),
        number(sample.source_feedback),
        optional(sample.voltage),
        optional(sample.current),
        optional(sample.power),
        number(sample.elapsed.as_secs_f64()),
        number(sample.channel_skew.as_secs_f64()),
        sample.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
    ]
}

fn number(value: f64) -> String {
    format!("{:.*e}", EXPORT_PRECISION, value)
}

fn optional(value: Option<f64>) -> String {
    value.map(number).unwrap_or_default()
}

fn seconds(value: f64, column: &str) -> LivResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| LivError::Serialization(format!("invalid {} value {}: {}", column, value, e)))
}

fn csv_error(err: csv::Error) -> LivError {
    LivError::Serialization(err.to_string())
}
