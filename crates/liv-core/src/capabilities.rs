//! Instrument Abstraction Layer
//!
//! The sweep controller never talks to a concrete driver. It talks to an
//! [`InstrumentBackend`], a small async capability interface that both the
//! simulated bench and the SCPI hardware backend implement. Each connected
//! instrument is represented by an opaque [`InstrumentHandle`] carrying its
//! role and the optional capabilities it advertises.
//!
//! # Design Philosophy
//!
//! - Every call is async (uses `#[async_trait]`) and is awaited to completion
//!   before the caller proceeds
//! - Backends are thread-safe (`Send + Sync`) so a session task can own them
//! - Optional behaviour (pulsing, compliance programming) is advertised via
//!   [`CapabilityFlags`] instead of runtime type inspection
//!
//! # Example
//!
//! ```rust,ignore
//! let source = backend.connect(InstrumentRole::Source, "GPIB0::1::INSTR").await?;
//! backend.configure_source(&source, SourceMode::Current).await?;
//! backend.set_output(&source, 0.020).await?;
//! backend.enable_output(&source, true).await?;
//! let drive = backend.read(&source).await?;
//! ```

use crate::error::LivResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Roles and modes
// =============================================================================

/// Function an instrument serves on the bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentRole {
    /// Source/measure unit or pulser driving the diode.
    Source,
    /// Reads the voltage across the diode.
    Voltmeter,
    /// Reads the current through the diode.
    Ammeter,
    /// Reads the emitted optical power.
    OpticalPowerMeter,
}

impl InstrumentRole {
    /// All roles, in channel read order after source feedback.
    pub const ALL: [InstrumentRole; 4] = [
        InstrumentRole::Source,
        InstrumentRole::Voltmeter,
        InstrumentRole::Ammeter,
        InstrumentRole::OpticalPowerMeter,
    ];
}

impl std::fmt::Display for InstrumentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentRole::Source => write!(f, "source"),
            InstrumentRole::Voltmeter => write!(f, "voltmeter"),
            InstrumentRole::Ammeter => write!(f, "ammeter"),
            InstrumentRole::OpticalPowerMeter => write!(f, "optical power meter"),
        }
    }
}

/// Quantity the source drives. The other electrical quantity is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Voltage,
    Current,
}

impl SourceMode {
    /// SI unit of the driven quantity.
    pub fn unit(&self) -> &'static str {
        match self {
            SourceMode::Voltage => "V",
            SourceMode::Current => "A",
        }
    }
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceMode::Voltage => write!(f, "voltage"),
            SourceMode::Current => write!(f, "current"),
        }
    }
}

/// Hardware output range of a source in one mode. Levels outside it are a
/// `Limit` error, independent of the configured compliance limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputRange {
    pub min: f64,
    pub max: f64,
}

impl OutputRange {
    /// `-limit..=limit`
    pub fn symmetric(limit: f64) -> Self {
        Self {
            min: -limit,
            max: limit,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Optional capabilities a handle may advertise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    /// Instrument can emit timed pulses (`configure_pulse`).
    pub pulsing: bool,
    /// Instrument accepts a hardware compliance limit (`set_compliance`).
    pub compliance: bool,
}

impl CapabilityFlags {
    /// No optional capabilities.
    pub const NONE: CapabilityFlags = CapabilityFlags {
        pulsing: false,
        compliance: false,
    };

    /// Every optional capability.
    pub const ALL: CapabilityFlags = CapabilityFlags {
        pulsing: true,
        compliance: true,
    };
}

// =============================================================================
// InstrumentHandle
// =============================================================================

/// Opaque reference to one connected instrument.
///
/// Created by [`InstrumentBackend::connect`] and released by
/// [`InstrumentBackend::disconnect`]. The `id` is unique within the backend
/// that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentHandle {
    id: u64,
    role: InstrumentRole,
    identifier: String,
    capabilities: CapabilityFlags,
}

impl InstrumentHandle {
    /// Backends call this when a connection succeeds.
    pub fn new(
        id: u64,
        role: InstrumentRole,
        identifier: impl Into<String>,
        capabilities: CapabilityFlags,
    ) -> Self {
        Self {
            id,
            role,
            identifier: identifier.into(),
            capabilities,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> InstrumentRole {
        self.role
    }

    /// Connection address the handle was opened with.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }
}

// =============================================================================
// InstrumentBackend
// =============================================================================

/// Capability interface every instrument backend implements.
///
/// # Contract
///
/// - Calls on one handle are issued sequentially by the sweep controller;
///   implementations need not reorder or pipeline them
/// - `set_output` rejects values outside the instrument's own hardware range
///   with [`LivError::Limit`](crate::error::LivError::Limit)
/// - Optional operations return
///   [`LivError::UnsupportedOperation`](crate::error::LivError::UnsupportedOperation)
///   when the handle does not advertise the matching capability flag
/// - `read` returns the instrument's primary measured quantity in SI units
///   (source feedback, volts, amperes or watts depending on role)
///
/// # Safety
///
/// `enable_output(false)` and `set_output(0.0)` must be safe to call at any
/// time, including after a failed operation, because the controller relies on
/// them to park the device before publishing a terminal state.
#[async_trait]
pub trait InstrumentBackend: Send + Sync {
    /// Open a connection to the instrument at `identifier`.
    async fn connect(&self, role: InstrumentRole, identifier: &str)
        -> LivResult<InstrumentHandle>;

    /// Select whether the source drives voltage or current.
    async fn configure_source(&self, handle: &InstrumentHandle, mode: SourceMode)
        -> LivResult<()>;

    /// Program the hardware compliance of the non-driven quantity.
    async fn set_compliance(&self, handle: &InstrumentHandle, limit: f64) -> LivResult<()>;

    /// Program the drive level.
    async fn set_output(&self, handle: &InstrumentHandle, value: f64) -> LivResult<()>;

    /// Take one reading.
    async fn read(&self, handle: &InstrumentHandle) -> LivResult<f64>;

    /// Switch the output on or off.
    async fn enable_output(&self, handle: &InstrumentHandle, enabled: bool) -> LivResult<()>;

    /// Program pulse width and repetition period.
    async fn configure_pulse(
        &self,
        handle: &InstrumentHandle,
        width: Duration,
        period: Duration,
    ) -> LivResult<()>;

    /// Release the connection.
    async fn disconnect(&self, handle: &InstrumentHandle) -> LivResult<()>;
}
