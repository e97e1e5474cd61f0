//! Export of measurement sessions to delimited text.
//!
//! Files start with a JSON metadata block, one `# `-prefixed line per JSON
//! line, followed by a CSV table with one row per sample:
//!
//! ```text
//! # {
//! #   "format_version": "1.0",
//! #   "device": { "name": "LD-785-03", ... },
//! #   "config": { ... },
//! #   "state": "Complete",
//! #   ...
//! # }
//! index,setpoint,source_feedback,voltage,current,power,elapsed_s,channel_skew_s,timestamp
//! 0,0.000000000e0,0.000000000e0,0.000000000e0,,1.000000000e-5,1.000000000e-3,0.000000000e0,2026-...
//! ```
//!
//! Numeric columns use scientific notation with nine fractional digits.
//! Channels a measurement kind does not sample are left empty.

pub mod csv_export;
pub mod metadata;

pub use csv_export::{export_session, read_session, read_session_from, write_session, CsvExporter};
pub use metadata::{DeviceInfo, ExportMetadata, EXPORT_FORMAT_VERSION, EXPORT_PRECISION};
