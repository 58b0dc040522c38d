//! Serial link shared by every device driver.
//!
//! A [`SerialLink`] owns exactly one connection to one port. It does not know
//! anything about the device on the other end; drivers build their command
//! vocabulary on top of [`SerialLink::write`] and [`SerialLink::read`].
//!
//! The bytes themselves move through a [`Transport`] produced by a
//! [`Connector`]. Production code uses [`TokioSerialConnector`]; tests plug in
//! [`crate::hardware::mock::MockConnector`].
//!
//! Protocol conventions (all three devices):
//! - ASCII commands terminated by `\r` (appended when missing)
//! - Replies are read as raw bytes with a timeout; a reply that never arrives
//!   surfaces as [`ReadOutcome::NoData`] and the caller decides whether to retry

use crate::error::{HoloError, HoloResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Command terminator expected by the stage, shutter and laser.
pub const LINE_TERMINATOR: char = '\r';

/// Quiet period that ends a reply once the first bytes have arrived.
const INTER_BYTE_GAP: Duration = Duration::from_millis(50);

/// Parity setting for a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Serial port settings for one device. Loaded once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialPortConfig {
    /// Port identifier (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate (e.g., 9600, 19200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Data bits per character (5-8)
    #[serde(default = "default_byte_size")]
    pub byte_size: u8,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_stop_bits() -> u8 {
    1
}

fn default_byte_size() -> u8 {
    8
}

impl Default for SerialPortConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            timeout: default_timeout(),
            stop_bits: default_stop_bits(),
            byte_size: default_byte_size(),
            parity: Parity::None,
        }
    }
}

impl SerialPortConfig {
    /// Settings for `port` with every other field at its default.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    /// Check the framing values are ones a UART can actually use.
    pub fn validate(&self) -> HoloResult<()> {
        if self.port.trim().is_empty() {
            return Err(HoloError::Configuration(
                "serial port name must not be empty".to_string(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(HoloError::Configuration(format!(
                "baud rate for '{}' must be positive",
                self.port
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(HoloError::Configuration(format!(
                "stop bits for '{}' must be 1 or 2, got {}",
                self.port, self.stop_bits
            )));
        }
        if !(5..=8).contains(&self.byte_size) {
            return Err(HoloError::Configuration(format!(
                "byte size for '{}' must be 5-8, got {}",
                self.port, self.byte_size
            )));
        }
        if self.timeout.is_zero() {
            return Err(HoloError::Configuration(format!(
                "timeout for '{}' must be non-zero",
                self.port
            )));
        }
        Ok(())
    }
}

/// Result of a read: bytes, or nothing before the timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// At least one byte arrived.
    Data(Vec<u8>),
    /// The timeout expired with nothing received.
    NoData,
}

impl ReadOutcome {
    /// Lossy text view of the reply, `None` when nothing arrived.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Self::NoData => None,
        }
    }

    /// True when the timeout expired without data.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::NoData)
    }
}

/// Byte pipe to an opened port.
#[async_trait]
pub trait Transport: Send {
    /// Write every byte of `bytes`.
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Read whatever is available into `buf`. May wait indefinitely; callers bound it.
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Flush and release the underlying port.
    async fn shutdown(&mut self) -> std::io::Result<()>;
}

/// Opens transports from port settings.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the port described by `config`.
    async fn connect(&self, config: &SerialPortConfig) -> HoloResult<Box<dyn Transport>>;
}

/// Capability shared by every device that talks over a serial link.
///
/// Device-specific commands live on the concrete driver types; this trait only
/// carries the primitives the session needs to acquire and release them.
#[async_trait]
pub trait SerialDevice: Send {
    /// Device label used in logs and errors.
    fn name(&self) -> &str;

    /// Whether the underlying link is open.
    fn is_open(&self) -> bool;

    /// Open the underlying link.
    async fn open(&mut self) -> HoloResult<()>;

    /// Send one command.
    async fn write(&mut self, payload: &str) -> HoloResult<()>;

    /// Read up to `n` reply bytes.
    async fn read(&mut self, n: usize) -> HoloResult<ReadOutcome>;

    /// Close the underlying link. Safe to call more than once.
    async fn close(&mut self) -> HoloResult<()>;
}

/// Drivers expose their link so [`SerialDevice`] can be implemented once for all of them.
pub trait LinkOwner: Send {
    /// The driver's link.
    fn link(&self) -> &SerialLink;

    /// Mutable access to the driver's link.
    fn link_mut(&mut self) -> &mut SerialLink;
}

#[async_trait]
impl<D: LinkOwner> SerialDevice for D {
    fn name(&self) -> &str {
        self.link().name()
    }

    fn is_open(&self) -> bool {
        self.link().is_open()
    }

    async fn open(&mut self) -> HoloResult<()> {
        self.link_mut().open().await
    }

    async fn write(&mut self, payload: &str) -> HoloResult<()> {
        self.link_mut().write(payload).await
    }

    async fn read(&mut self, n: usize) -> HoloResult<ReadOutcome> {
        self.link_mut().read(n).await
    }

    async fn close(&mut self) -> HoloResult<()> {
        self.link_mut().close().await
    }
}

/// Exclusive connection to one serial port.
pub struct SerialLink {
    /// Device label ("stage", "shutter", "laser")
    name: String,
    /// Port settings, fixed for the lifetime of the link
    config: SerialPortConfig,
    /// Opens the transport on `open()`
    connector: Arc<dyn Connector>,
    /// Present only while the link is open
    transport: Option<Box<dyn Transport>>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("name", &self.name)
            .field("port", &self.config.port)
            .field("open", &self.is_open())
            .finish()
    }
}

impl SerialLink {
    /// Create a closed link.
    pub fn new(
        name: impl Into<String>,
        config: SerialPortConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            connector,
            transport: None,
        }
    }

    /// Device label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Port settings.
    pub fn config(&self) -> &SerialPortConfig {
        &self.config
    }

    /// Whether a transport is held.
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Open the port. A failed open leaves the link closed.
    pub async fn open(&mut self) -> HoloResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let transport = self.connector.connect(&self.config).await?;
        self.transport = Some(transport);
        debug!(
            device = %self.name,
            port = %self.config.port,
            baud = self.config.baud_rate,
            "serial port opened"
        );
        Ok(())
    }

    /// Send `payload`, appending `\r` if it has none.
    pub async fn write(&mut self, payload: &str) -> HoloResult<()> {
        let port = self.config.port.clone();
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| HoloError::connection(&port, "write on closed link"))?;

        let mut command = payload.to_string();
        if !command.contains(LINE_TERMINATOR) {
            command.push(LINE_TERMINATOR);
        }

        transport
            .write_all(command.as_bytes())
            .await
            .map_err(|e| HoloError::connection(&port, format!("write '{}' failed: {e}", payload.trim())))?;

        debug!(device = %self.name, command = %payload.trim(), "sent");
        Ok(())
    }

    /// Read up to `n` bytes.
    ///
    /// Waits at most the configured timeout for the first byte. Once data is
    /// flowing the read ends at `n` bytes or after a short quiet period,
    /// whichever comes first.
    pub async fn read(&mut self, n: usize) -> HoloResult<ReadOutcome> {
        let port = self.config.port.clone();
        let deadline = Instant::now() + self.config.timeout;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| HoloError::connection(&port, "read on closed link"))?;

        let mut reply: Vec<u8> = Vec::with_capacity(n);
        let mut buf = vec![0u8; n.max(1)];

        while reply.len() < n {
            let window = if reply.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                INTER_BYTE_GAP
            };
            if window.is_zero() {
                break;
            }

            let want = n - reply.len();
            match timeout(window, transport.read(&mut buf[..want])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(count)) => reply.extend_from_slice(&buf[..count]),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if !reply.is_empty() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    return Err(HoloError::connection(&port, format!("read failed: {e}")));
                }
                Err(_) => break,
            }
        }

        if reply.is_empty() {
            debug!(device = %self.name, "no reply before timeout");
            return Ok(ReadOutcome::NoData);
        }
        debug!(
            device = %self.name,
            reply = %String::from_utf8_lossy(&reply).trim(),
            "received"
        );
        Ok(ReadOutcome::Data(reply))
    }

    /// Release the port. Closing a closed link is a no-op.
    pub async fn close(&mut self) -> HoloResult<()> {
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        let result = transport.shutdown().await;
        drop(transport);
        match result {
            Ok(()) => {
                debug!(device = %self.name, port = %self.config.port, "serial port closed");
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.name, port = %self.config.port, error = %e, "serial port closed with error");
                Err(HoloError::connection(&self.config.port, format!("close failed: {e}")))
            }
        }
    }
}

/// Pull the first numeric token out of a reply, skipping an echoed query.
///
/// Lasers of this family echo the query (`?HID\r\n42185.000\r\n`), so the
/// echo is removed before looking for a number.
pub fn parse_numeric_reply(reply: &str, echo: &str) -> Option<f64> {
    let body = reply.trim_start().strip_prefix(echo).unwrap_or(reply);
    body.split(|c: char| c.is_whitespace() || c == '=' || c == ',')
        .filter(|token| !token.is_empty())
        .find_map(|token| token.parse::<f64>().ok())
}

/// Connector backed by `tokio-serial`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSerialConnector;

#[cfg(feature = "tokio_serial")]
mod native {
    use super::{Parity, SerialPortConfig, Transport};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::{DataBits, SerialStream, StopBits};

    pub(super) fn open(config: &SerialPortConfig) -> tokio_serial::Result<SerialStream> {
        use tokio_serial::SerialPortBuilderExt;

        let data_bits = match config.byte_size {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = if config.stop_bits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        };
        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };

        tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(config.timeout)
            .open_native_async()
    }

    #[async_trait]
    impl Transport for SerialStream {
        async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            AsyncWriteExt::write_all(self, bytes).await?;
            AsyncWriteExt::flush(self).await
        }

        async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            AsyncReadExt::read(self, buf).await
        }

        async fn shutdown(&mut self) -> std::io::Result<()> {
            AsyncWriteExt::flush(self).await
        }
    }
}

#[async_trait]
impl Connector for TokioSerialConnector {
    async fn connect(&self, config: &SerialPortConfig) -> HoloResult<Box<dyn Transport>> {
        config.validate()?;

        #[cfg(feature = "tokio_serial")]
        {
            let stream = native::open(config).map_err(|e| {
                HoloError::connection(
                    &config.port,
                    format!("failed to open at {} baud: {e}", config.baud_rate),
                )
            })?;
            Ok(Box::new(stream))
        }

        #[cfg(not(feature = "tokio_serial"))]
        {
            Err(HoloError::SerialFeatureDisabled)
        }
    }
}
