//! Sample rows produced by a sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One synchronized reading of all channels at one setpoint.
///
/// Channels a measurement kind does not sample are `None`. For an L-I sweep
/// the driven quantity is filled from the source feedback and the other
/// electrical quantity stays `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    /// Position in the setpoint plan.
    pub index: usize,
    /// Commanded drive level.
    pub setpoint: f64,
    /// Drive level the source reports back.
    pub source_feedback: f64,
    /// Volts.
    pub voltage: Option<f64>,
    /// Amperes.
    pub current: Option<f64>,
    /// Watts.
    pub power: Option<f64>,
    /// Offset of the first channel read from the start of the run.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Wall-clock time of the first channel read.
    pub timestamp: DateTime<Utc>,
    /// Spread between the first and last channel read.
    #[serde(with = "humantime_serde")]
    pub channel_skew: Duration,
}
