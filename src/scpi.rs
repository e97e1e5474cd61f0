//! SCPI backend for real instruments.
//!
//! Speaks line-terminated SCPI over any byte stream. Raw TCP sockets are
//! opened for identifiers of the form `host:port` or
//! `TCPIP::host::port::SOCKET`; tests and bridges can attach their own
//! stream for an identifier with [`ScpiBackend::attach`].
//!
//! Command set (Keithley 24xx style source-measure units):
//!
//! | Operation | Commands |
//! |---|---|
//! | connect | `*RST`, `*IDN?` |
//! | configure_source | `SOUR:FUNC VOLT\|CURR`, `SENS:FUNC "CURR"\|"VOLT"`, `FORM:ELEM VOLT,CURR` |
//! | set_compliance | `SENS:CURR:PROT:LEV x` (voltage drive) / `SENS:VOLT:PROT:LEV x` |
//! | set_output | `SOUR:VOLT:LEV x` / `SOUR:CURR:LEV x` |
//! | read | `READ?` |
//! | enable_output | `OUTP ON` / `OUTP OFF` |
//! | configure_pulse | `PULS:WIDT s`, `PULS:PER s` |
//!
//! `set_output` checks the level against the source's hardware range before
//! anything is sent; an out-of-range level is a `Limit` error.
//!
//! Errors are never retried here. The sweep controller decides what a
//! failed command means.

use async_trait::async_trait;
use liv_core::capabilities::{
    CapabilityFlags, InstrumentBackend, InstrumentHandle, InstrumentRole, OutputRange, SourceMode,
};
use liv_core::error::{DriverError, DriverErrorKind, LivError, LivResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Port used by raw-socket SCPI instruments when the identifier has none.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Voltage range of a Keithley 2400 class source.
pub const DEFAULT_VOLTAGE_RANGE: f64 = 21.0;

/// Current range of a Keithley 2400 class source.
pub const DEFAULT_CURRENT_RANGE: f64 = 1.05;

/// Silence that ends the discard of stale input before a query.
const DRAIN_QUIET: Duration = Duration::from_millis(2);

pub trait ScpiTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ScpiTransport for T {}
type DynTransport = Box<dyn ScpiTransport>;
type SharedPort = Arc<Mutex<BufReader<DynTransport>>>;

#[derive(Debug, Error)]
enum ScpiError {
    #[error("write failed: {0}")]
    Write(std::io::Error),
    #[error("read failed: {0}")]
    Read(std::io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("instrument closed the connection")]
    Closed,
    #[error("unexpected reply {0:?}")]
    BadReply(String),
}

impl ScpiError {
    fn kind(&self) -> DriverErrorKind {
        match self {
            ScpiError::Write(_) | ScpiError::Read(_) | ScpiError::Closed => {
                DriverErrorKind::Communication
            }
            ScpiError::Timeout(_) => DriverErrorKind::Timeout,
            ScpiError::BadReply(_) => DriverErrorKind::InvalidResponse,
        }
    }

    fn into_liv(self, role: InstrumentRole) -> LivError {
        DriverError::new(driver_name(role), self.kind(), self.to_string()).into()
    }
}

fn driver_name(role: InstrumentRole) -> &'static str {
    match role {
        InstrumentRole::Source => "scpi_source",
        InstrumentRole::Voltmeter => "scpi_voltmeter",
        InstrumentRole::Ammeter => "scpi_ammeter",
        InstrumentRole::OpticalPowerMeter => "scpi_power_meter",
    }
}

/// `host:port` for a socket identifier, or `None` when it is not one.
fn socket_address(identifier: &str) -> Option<String> {
    if let Some(rest) = identifier.strip_prefix("TCPIP") {
        // TCPIP[board]::host::port::SOCKET
        let mut parts = rest.split("::").skip(1);
        let host = parts.next().filter(|h| !h.is_empty())?;
        let port = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_SCPI_PORT);
        return Some(format!("{}:{}", host, port));
    }
    if identifier.contains("::") || identifier.trim().is_empty() {
        return None;
    }
    if identifier.contains(':') {
        Some(identifier.to_string())
    } else {
        Some(format!("{}:{}", identifier, DEFAULT_SCPI_PORT))
    }
}

/// Numeric field `index` of a comma-separated reply.
fn parse_reading(reply: &str, index: usize) -> Result<f64, ScpiError> {
    reply
        .split(',')
        .nth(index)
        .map(str::trim)
        .and_then(|field| field.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or_else(|| ScpiError::BadReply(reply.to_string()))
}

// =============================================================================
// Link
// =============================================================================

/// One open instrument connection.
struct Link {
    role: InstrumentRole,
    port: SharedPort,
    mode: parking_lot::Mutex<SourceMode>,
    timeout: Duration,
}

impl Link {
    async fn write(&self, command: &str) -> Result<(), ScpiError> {
        let mut port = self.port.lock().await;
        debug!(role = %self.role, command, "scpi write");
        let line = format!("{}\n", command);
        let io = async {
            port.get_mut().write_all(line.as_bytes()).await?;
            port.get_mut().flush().await
        };
        tokio::time::timeout(self.timeout, io)
            .await
            .map_err(|_| ScpiError::Timeout(self.timeout))?
            .map_err(ScpiError::Write)
    }

    /// Send `command` and return the reply line.
    ///
    /// Input left over from an earlier query that timed out is discarded
    /// first, so a late reply is never taken for this one. The write and the
    /// read share one timeout.
    async fn query(&self, command: &str) -> Result<String, ScpiError> {
        let mut port = self.port.lock().await;
        self.discard_stale_input(&mut port).await;
        debug!(role = %self.role, command, "scpi query");
        let line = format!("{}\n", command);
        let exchange = async {
            port.get_mut()
                .write_all(line.as_bytes())
                .await
                .map_err(ScpiError::Write)?;
            port.get_mut().flush().await.map_err(ScpiError::Write)?;

            let mut reply = String::new();
            match port.read_line(&mut reply).await {
                Ok(0) => Err(ScpiError::Closed),
                Ok(_) => Ok(reply.trim().to_string()),
                Err(e) => Err(ScpiError::Read(e)),
            }
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ScpiError::Timeout(self.timeout))?
    }

    async fn discard_stale_input(&self, port: &mut BufReader<DynTransport>) {
        let buffered = port.buffer().len();
        if buffered > 0 {
            debug!(role = %self.role, bytes = buffered, "discarding buffered reply");
            port.consume(buffered);
        }

        let deadline = Instant::now() + self.timeout;
        let mut scratch = [0u8; 256];
        while Instant::now() < deadline {
            match tokio::time::timeout(DRAIN_QUIET, port.get_mut().read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => debug!(role = %self.role, bytes = n, "discarding stale reply"),
                Ok(Err(e)) => {
                    debug!(role = %self.role, error = %e, "stale input drain stopped");
                    break;
                }
            }
        }
    }
}

// =============================================================================
// ScpiBackend
// =============================================================================

/// Instrument backend talking SCPI to real hardware.
pub struct ScpiBackend {
    timeout: Duration,
    voltage_range: OutputRange,
    current_range: OutputRange,
    capabilities: HashMap<InstrumentRole, CapabilityFlags>,
    next_id: AtomicU64,
    links: parking_lot::Mutex<HashMap<u64, Arc<Link>>>,
    attached: parking_lot::Mutex<HashMap<String, DynTransport>>,
}

impl ScpiBackend {
    /// Backend with the given per-command timeout.
    ///
    /// Sources advertise hardware compliance and no pulsing until told
    /// otherwise with [`ScpiBackend::with_capabilities`].
    pub fn new(timeout: Duration) -> Self {
        let mut capabilities = HashMap::new();
        capabilities.insert(
            InstrumentRole::Source,
            CapabilityFlags {
                pulsing: false,
                compliance: true,
            },
        );
        Self {
            timeout,
            voltage_range: OutputRange::symmetric(DEFAULT_VOLTAGE_RANGE),
            current_range: OutputRange::symmetric(DEFAULT_CURRENT_RANGE),
            capabilities,
            next_id: AtomicU64::new(1),
            links: parking_lot::Mutex::new(HashMap::new()),
            attached: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Override the capabilities advertised for a role.
    pub fn with_capabilities(mut self, role: InstrumentRole, flags: CapabilityFlags) -> Self {
        self.capabilities.insert(role, flags);
        self
    }

    /// Override the source's hardware output ranges.
    pub fn with_output_ranges(mut self, voltage: OutputRange, current: OutputRange) -> Self {
        self.voltage_range = voltage;
        self.current_range = current;
        self
    }

    fn range_for(&self, mode: SourceMode) -> OutputRange {
        match mode {
            SourceMode::Voltage => self.voltage_range,
            SourceMode::Current => self.current_range,
        }
    }

    /// Use `transport` the next time `identifier` is connected.
    pub fn attach<T: ScpiTransport + 'static>(&self, identifier: impl Into<String>, transport: T) {
        self.attached
            .lock()
            .insert(identifier.into(), Box::new(transport));
    }

    async fn open(&self, identifier: &str) -> LivResult<DynTransport> {
        if let Some(transport) = self.attached.lock().remove(identifier) {
            return Ok(transport);
        }
        let address = socket_address(identifier).ok_or_else(|| LivError::Connection {
            identifier: identifier.to_string(),
            reason: "not a socket address (expected host:port or TCPIP::host::port::SOCKET)"
                .into(),
        })?;
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| LivError::Connection {
                identifier: identifier.to_string(),
                reason: format!("no answer from {} within {:?}", address, self.timeout),
            })?
            .map_err(|e| LivError::Connection {
                identifier: identifier.to_string(),
                reason: e.to_string(),
            })?;
        stream
            .set_nodelay(true)
            .map_err(|e| LivError::Connection {
                identifier: identifier.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(stream))
    }

    fn link(&self, handle: &InstrumentHandle) -> LivResult<Arc<Link>> {
        self.links.lock().get(&handle.id()).cloned().ok_or_else(|| {
            DriverError::new(
                driver_name(handle.role()),
                DriverErrorKind::Communication,
                format!("handle {} is not connected", handle.id()),
            )
            .into()
        })
    }

    fn source_link(&self, handle: &InstrumentHandle, operation: &str) -> LivResult<Arc<Link>> {
        if handle.role() != InstrumentRole::Source {
            return Err(LivError::UnsupportedOperation(format!(
                "{} on {}",
                operation,
                handle.role()
            )));
        }
        self.link(handle)
    }

    async fn write(&self, link: &Link, command: &str) -> LivResult<()> {
        link.write(command).await.map_err(|e| e.into_liv(link.role))
    }
}

#[async_trait]
impl InstrumentBackend for ScpiBackend {
    #[instrument(skip(self), err)]
    async fn connect(
        &self,
        role: InstrumentRole,
        identifier: &str,
    ) -> LivResult<InstrumentHandle> {
        let transport = self.open(identifier).await?;
        let link = Link {
            role,
            port: Arc::new(Mutex::new(BufReader::new(transport))),
            mode: parking_lot::Mutex::new(SourceMode::Current),
            timeout: self.timeout,
        };

        let identity = async {
            link.write("*RST").await?;
            link.query("*IDN?").await
        }
        .await
        .map_err(|e| LivError::Connection {
            identifier: identifier.to_string(),
            reason: e.to_string(),
        })?;
        if identity.is_empty() {
            return Err(LivError::Connection {
                identifier: identifier.to_string(),
                reason: "empty *IDN? reply".into(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.links.lock().insert(id, Arc::new(link));
        info!(%role, identifier, identity = %identity, "scpi instrument connected");

        let capabilities = self.capabilities.get(&role).copied().unwrap_or_default();
        Ok(InstrumentHandle::new(id, role, identifier, capabilities))
    }

    async fn configure_source(&self, handle: &InstrumentHandle, mode: SourceMode) -> LivResult<()> {
        let link = self.source_link(handle, "configure_source")?;
        let (function, sense) = match mode {
            SourceMode::Voltage => ("VOLT", "CURR"),
            SourceMode::Current => ("CURR", "VOLT"),
        };
        self.write(&link, &format!("SOUR:FUNC {}", function)).await?;
        self.write(&link, &format!("SENS:FUNC \"{}\"", sense)).await?;
        self.write(&link, "FORM:ELEM VOLT,CURR").await?;
        *link.mode.lock() = mode;
        Ok(())
    }

    async fn set_compliance(&self, handle: &InstrumentHandle, limit: f64) -> LivResult<()> {
        if !handle.capabilities().compliance {
            return Err(LivError::UnsupportedOperation(format!(
                "set_compliance on {} without compliance support",
                handle.role()
            )));
        }
        let link = self.link(handle)?;
        let sense = match *link.mode.lock() {
            SourceMode::Voltage => "CURR",
            SourceMode::Current => "VOLT",
        };
        self.write(&link, &format!("SENS:{}:PROT:LEV {}", sense, limit))
            .await
    }

    async fn set_output(&self, handle: &InstrumentHandle, value: f64) -> LivResult<()> {
        let link = self.source_link(handle, "set_output")?;
        let mode = *link.mode.lock();
        let range = self.range_for(mode);
        if !(value.is_finite() && range.contains(value)) {
            return Err(LivError::Limit {
                value,
                min: range.min,
                max: range.max,
            });
        }
        let function = match mode {
            SourceMode::Voltage => "VOLT",
            SourceMode::Current => "CURR",
        };
        self.write(&link, &format!("SOUR:{}:LEV {}", function, value))
            .await
    }

    async fn read(&self, handle: &InstrumentHandle) -> LivResult<f64> {
        let link = self.link(handle)?;
        let reply = link
            .query("READ?")
            .await
            .map_err(|e| e.into_liv(link.role))?;
        // Sources answer "volts,amps"; pick the driven quantity
        let index = match (link.role, *link.mode.lock()) {
            (InstrumentRole::Source, SourceMode::Current) => 1,
            _ => 0,
        };
        parse_reading(&reply, index).map_err(|e| e.into_liv(link.role))
    }

    async fn enable_output(&self, handle: &InstrumentHandle, enabled: bool) -> LivResult<()> {
        let link = self.source_link(handle, "enable_output")?;
        self.write(&link, if enabled { "OUTP ON" } else { "OUTP OFF" })
            .await
    }

    async fn configure_pulse(
        &self,
        handle: &InstrumentHandle,
        width: Duration,
        period: Duration,
    ) -> LivResult<()> {
        if !handle.capabilities().pulsing {
            return Err(LivError::UnsupportedOperation(format!(
                "configure_pulse on {} without pulsing support",
                handle.role()
            )));
        }
        let link = self.link(handle)?;
        self.write(&link, &format!("PULS:WIDT {}", width.as_secs_f64()))
            .await?;
        self.write(&link, &format!("PULS:PER {}", period.as_secs_f64()))
            .await
    }

    async fn disconnect(&self, handle: &InstrumentHandle) -> LivResult<()> {
        let link = self.links.lock().remove(&handle.id());
        let Some(link) = link else {
            return Err(DriverError::new(
                driver_name(handle.role()),
                DriverErrorKind::Communication,
                format!("handle {} is not connected", handle.id()),
            )
            .into());
        };
        let mut port = link.port.lock().await;
        port.get_mut().shutdown().await?;
        debug!(role = %link.role, "scpi instrument disconnected");
        Ok(())
    }
}
