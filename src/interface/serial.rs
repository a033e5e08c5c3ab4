//! Serial (RS-232 / USB-serial) interface.
//!
//! Line and byte oriented transport for instruments and DUT consoles. Port
//! opening is delegated to a [`PortOpener`] so the same interface runs against
//! real hardware ([`SystemPortOpener`], backed by `tokio-serial`) or an in-memory
//! link in tests.
//!
//! Besides request/response I/O the interface has a stream mode: a background
//! task accumulates every received line until [`SerialInterface::stop_stream`]
//! returns them. Stream capture is line-oriented text and is refused in binary
//! mode.

use crate::capture::{run_capture, CaptureSettings, CaptureStatus, MemorySink, DEFAULT_STOP_TIMEOUT};
use crate::endpoint::{Binding, ConnectionState, Endpoint};
use crate::error::{Fault, FaultKind, FaultOrigin, FaultResult};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Trait alias for async serial port I/O.
///
/// Implemented by `tokio_serial::SerialStream` and by `tokio::io::DuplexStream`,
/// which tests use as a fake serial link.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Serial port shared between the owning interface and its stream task.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap an opened port for shared, buffered access.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Character size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataBits {
    /// 5 bits
    Five,
    /// 6 bits
    Six,
    /// 7 bits
    Seven,
    /// 8 bits
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    /// One stop bit
    #[default]
    One,
    /// Two stop bits
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Per-endpoint serial configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Character size
    #[serde(default)]
    pub data_bits: DataBits,
    /// Parity
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits
    #[serde(default)]
    pub stop_bits: StopBits,
    /// Flow control
    #[serde(default)]
    pub flow_control: FlowControl,
    /// Appended to every command written with `write_line`
    #[serde(default = "default_eol")]
    pub eol: String,
    /// Console prompt that terminates a response; empty means "line ends at `\n`"
    #[serde(default)]
    pub prompt: String,
    /// Idle bound on a single read
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Bound on opening the port
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Pause after every write, giving the device time to process it
    #[serde(default = "default_write_settle", with = "humantime_serde")]
    pub write_settle: Duration,
    /// Raw byte mode: no EOL appended, no text clean-up
    #[serde(default)]
    pub binary: bool,
}

fn default_eol() -> String {
    "\r".to_string()
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_write_settle() -> Duration {
    Duration::from_millis(100)
}

impl SerialConfig {
    /// 115200 8N1, no flow control, `\r` EOL, no prompt.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: 115_200,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
            eol: default_eol(),
            prompt: String::new(),
            read_timeout: default_read_timeout(),
            connect_timeout: default_connect_timeout(),
            write_settle: default_write_settle(),
            binary: false,
        }
    }

    /// Set baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set character framing
    pub fn with_framing(mut self, data_bits: DataBits, parity: Parity, stop_bits: StopBits) -> Self {
        self.data_bits = data_bits;
        self.parity = parity;
        self.stop_bits = stop_bits;
        self
    }

    /// Set flow control
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Set end-of-line marker for commands
    pub fn with_eol(mut self, eol: impl Into<String>) -> Self {
        self.eol = eol.into();
        self
    }

    /// Set response prompt marker
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Set read timeout
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the pause after every write
    pub fn with_write_settle(mut self, write_settle: Duration) -> Self {
        self.write_settle = write_settle;
        self
    }

    /// Enable raw byte mode
    pub fn with_binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    /// Same settings on a different port
    pub fn for_port(&self, port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..self.clone()
        }
    }
}

/// Opens serial ports described by a [`SerialConfig`].
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open the port; the returned stream is exclusively owned by the caller.
    async fn open(&self, config: &SerialConfig) -> Result<DynSerial>;

    /// Names of the ports present on this machine.
    async fn available_ports(&self) -> Result<Vec<String>>;
}

/// Opens real ports through `tokio-serial`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl PortOpener for SystemPortOpener {
    async fn open(&self, config: &SerialConfig) -> Result<DynSerial> {
        use anyhow::Context;
        use tokio_serial::SerialPortBuilderExt;

        let config = config.clone();
        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&config.port, config.baud_rate)
                .data_bits(match config.data_bits {
                    DataBits::Five => tokio_serial::DataBits::Five,
                    DataBits::Six => tokio_serial::DataBits::Six,
                    DataBits::Seven => tokio_serial::DataBits::Seven,
                    DataBits::Eight => tokio_serial::DataBits::Eight,
                })
                .parity(match config.parity {
                    Parity::None => tokio_serial::Parity::None,
                    Parity::Odd => tokio_serial::Parity::Odd,
                    Parity::Even => tokio_serial::Parity::Even,
                })
                .stop_bits(match config.stop_bits {
                    StopBits::One => tokio_serial::StopBits::One,
                    StopBits::Two => tokio_serial::StopBits::Two,
                })
                .flow_control(match config.flow_control {
                    FlowControl::None => tokio_serial::FlowControl::None,
                    FlowControl::Software => tokio_serial::FlowControl::Software,
                    FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
                })
                .timeout(config.read_timeout)
                .open_native_async()
                .with_context(|| {
                    format!(
                        "Failed to open serial port '{}' at {} baud",
                        config.port, config.baud_rate
                    )
                })
        })
        .await
        .context("spawn_blocking for serial port opening failed")??;

        Ok(Box::new(stream))
    }

    async fn available_ports(&self) -> Result<Vec<String>> {
        use anyhow::Context;

        let ports = tokio::task::spawn_blocking(tokio_serial::available_ports)
            .await
            .context("spawn_blocking for port enumeration failed")?
            .context("Failed to enumerate serial ports")?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl PortOpener for SystemPortOpener {
    async fn open(&self, _config: &SerialConfig) -> Result<DynSerial> {
        anyhow::bail!("Serial support not enabled. Rebuild with --features instrument_serial")
    }

    async fn available_ports(&self) -> Result<Vec<String>> {
        anyhow::bail!("Serial support not enabled. Rebuild with --features instrument_serial")
    }
}

/// Open `config.port` with `opener`, bounded by the connect timeout.
pub(crate) async fn open_bounded(
    opener: &dyn PortOpener,
    config: &SerialConfig,
    origin: &FaultOrigin,
) -> FaultResult<DynSerial> {
    let detail = || {
        format!(
            "Error connecting to serial interface via port: {}, baudrate: {}",
            config.port, config.baud_rate
        )
    };
    match timeout(config.connect_timeout, opener.open(config)).await {
        Ok(Ok(port)) => Ok(port),
        Ok(Err(e)) => Err(origin.wrap(FaultKind::Connection, detail(), e)),
        Err(_) => Err(origin
            .connection(detail())
            .with_original(format!("open timed out after {:?}", config.connect_timeout))),
    }
}

/// Output of a stream collected by [`SerialInterface::stop_stream`].
#[derive(Debug, Clone, PartialEq)]
pub struct StreamCapture {
    /// Received records joined with `\n`.
    pub data: String,
    /// Fault that ended the stream before it was asked to stop.
    pub fault: Option<Fault>,
}

impl StreamCapture {
    /// True if the stream ran until it was stopped.
    pub fn is_complete(&self) -> bool {
        self.fault.is_none()
    }
}

struct StreamSession {
    cancel: watch::Sender<bool>,
    worker: JoinHandle<(CaptureStatus, MemorySink)>,
}

/// Serial endpoint.
pub struct SerialInterface {
    config: SerialConfig,
    opener: Arc<dyn PortOpener>,
    origin: FaultOrigin,
    binding: Binding<SharedPort>,
    last_tx: Vec<u8>,
    stream: Option<StreamSession>,
    stop_timeout: Duration,
    span: Span,
}

impl SerialInterface {
    /// Interface on a real port.
    pub fn new(config: SerialConfig) -> Self {
        Self::with_opener(config, Arc::new(SystemPortOpener))
    }

    /// Interface whose port is opened by `opener`.
    pub fn with_opener(config: SerialConfig, opener: Arc<dyn PortOpener>) -> Self {
        let span = info_span!("serial", port = %config.port);
        Self {
            config,
            opener,
            origin: FaultOrigin::new("RS232"),
            binding: Binding::new(),
            last_tx: Vec::new(),
            stream: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            span,
        }
    }

    /// Replace the tracing span this interface logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Bound on how long `stop_stream` waits for the stream task.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Port configuration.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Opener used for this interface's port.
    pub fn opener(&self) -> Arc<dyn PortOpener> {
        self.opener.clone()
    }

    /// True while a stream task is running, including one that outlived a
    /// timed-out `stop_stream`.
    pub fn is_streaming(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| !s.worker.is_finished())
    }

    /// Write a command followed by the EOL marker (raw bytes in binary mode).
    pub async fn write_line(&mut self, command: &str) -> FaultResult<()> {
        let mut frame = command.as_bytes().to_vec();
        if !self.config.binary {
            frame.extend_from_slice(self.config.eol.as_bytes());
        }
        self.send(frame).await
    }

    async fn send(&mut self, frame: Vec<u8>) -> FaultResult<()> {
        let port = self.binding.get(&self.origin)?.clone();
        {
            let mut guard = port.lock().await;
            let inner = guard.get_mut();
            if let Err(e) = inner.write_all(&frame).await {
                return Err(self.origin.wrap(FaultKind::Port, "write failed", e));
            }
            if let Err(e) = inner.flush().await {
                return Err(self.origin.wrap(FaultKind::Port, "flush failed", e));
            }
        }
        debug!(parent: &self.span, tx = %String::from_utf8_lossy(&frame).trim_end(), "written");
        self.last_tx = frame;
        if !self.config.write_settle.is_zero() {
            tokio::time::sleep(self.config.write_settle).await;
        }
        Ok(())
    }

    /// Read raw bytes until the prompt (or `\n` without a prompt) arrives, or
    /// until the read timeout passes with no new data.
    async fn read_raw(&mut self) -> FaultResult<Vec<u8>> {
        let port = self.binding.get(&self.origin)?.clone();
        let terminator: Vec<u8> = if self.config.prompt.is_empty() {
            b"\n".to_vec()
        } else {
            self.config.prompt.as_bytes().to_vec()
        };

        let mut guard = port.lock().await;
        let mut received = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match timeout(self.config.read_timeout, guard.read(&mut chunk)).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    received.extend_from_slice(&chunk[..n]);
                    if contains(&received, &terminator) {
                        break;
                    }
                }
                Ok(Err(e)) => return Err(self.origin.wrap(FaultKind::Port, "read failed", e)),
            }
        }
        debug!(parent: &self.span, bytes = received.len(), "read");
        Ok(received)
    }

    /// Read a response and clean it up: echoed command and prompt removed,
    /// non-printable characters dropped, outer whitespace trimmed.
    pub async fn read_response(&mut self) -> FaultResult<String> {
        let raw = self.read_raw().await?;
        Ok(clean_response(&raw, &self.last_tx, &self.config.prompt))
    }

    /// Write a command and return the cleaned response.
    pub async fn communicate(&mut self, command: &str) -> FaultResult<String> {
        self.write_line(command).await?;
        self.read_response().await
    }

    /// Start accumulating received lines on a background task.
    ///
    /// Rejected with a Port fault while a stream task is still running, and
    /// with a Parameter fault in binary mode. Output of a stream that already
    /// ended without being collected is discarded.
    pub async fn start_stream(&mut self, timestamps: bool) -> FaultResult<()> {
        if self.config.binary {
            return Err(self.origin.parameter("stream capture is line-oriented and unavailable in binary mode"));
        }
        if let Some(previous) = &self.stream {
            if !previous.worker.is_finished() {
                return Err(self.origin.port("stream already running"));
            }
            warn!(parent: &self.span, "discarding uncollected output of an ended stream");
            self.stream = None;
        }
        let mut port = self.binding.get(&self.origin)?.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let settings = CaptureSettings {
            timestamps,
            read_timeout: self.config.read_timeout,
        };
        let origin = self.origin.clone();
        let span = info_span!(parent: &self.span, "stream");

        let worker = tokio::spawn(
            async move {
                let mut sink = MemorySink::default();
                let captured = Arc::new(AtomicU64::new(0));
                let status = run_capture(&mut port, &mut sink, &settings, &cancel_rx, &captured, &origin).await;
                (status, sink)
            }
            .instrument(span),
        );

        info!(parent: &self.span, timestamps, "stream started");
        self.stream = Some(StreamSession {
            cancel: cancel_tx,
            worker,
        });
        Ok(())
    }

    /// Stop the stream task and return what it received.
    ///
    /// Returns `None` when no stream was running or the task did not finish
    /// within the stop timeout. A task that timed out stays owned by the
    /// interface and a later call collects it.
    pub async fn stop_stream(&mut self) -> Option<StreamCapture> {
        let session = self.stream.as_mut()?;
        let _ = session.cancel.send(true);

        let joined = match timeout(self.stop_timeout, &mut session.worker).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(parent: &self.span, timeout = ?self.stop_timeout, "stream task did not stop in time");
                return None;
            }
        };
        self.stream = None;

        match joined {
            Ok((status, sink)) => {
                let fault = match status {
                    CaptureStatus::Completed => None,
                    CaptureStatus::PortError(fault) => {
                        warn!(parent: &self.span, %fault, "stream ended with port error");
                        Some(fault)
                    }
                };
                info!(parent: &self.span, lines = sink.lines().len(), "stream stopped");
                Some(StreamCapture {
                    data: sink.joined(),
                    fault,
                })
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "stream task failed");
                None
            }
        }
    }

    /// Write stream data to a text file, one record per line.
    pub async fn save_stream(&self, path: &Path, data: &str) -> FaultResult<()> {
        if data.is_empty() {
            warn!(parent: &self.span, "no stream data to save");
            return Ok(());
        }
        let mut contents = String::with_capacity(data.len() + 1);
        for line in data.split('\n') {
            contents.push_str(line);
            contents.push('\n');
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| self.origin.wrap(FaultKind::Port, format!("failed to save stream to {}", path.display()), e))?;
        info!(parent: &self.span, path = %path.display(), "stream saved");
        Ok(())
    }
}

#[async_trait]
impl Endpoint for SerialInterface {
    fn identity(&self) -> &str {
        self.origin.identity()
    }

    fn state(&self) -> ConnectionState {
        self.binding.state()
    }

    async fn bind(&mut self) -> FaultResult<()> {
        info!(parent: &self.span, baud = self.config.baud_rate, "connecting");
        let port = open_bounded(self.opener.as_ref(), &self.config, &self.origin).await?;
        self.binding.bind(wrap_shared(port));
        Ok(())
    }

    async fn release(&mut self) {
        info!(parent: &self.span, "disconnecting");
        self.stop_stream().await;
        if let Some(port) = self.binding.take() {
            let mut guard = port.lock().await;
            if let Err(e) = guard.get_mut().shutdown().await {
                warn!(parent: &self.span, error = %e, "error closing port");
            }
        }
        self.last_tx.clear();
    }

    async fn read(&mut self) -> FaultResult<Bytes> {
        self.read_raw().await.map(Bytes::from)
    }

    async fn write(&mut self, data: &[u8]) -> FaultResult<()> {
        self.send(data.to_vec()).await
    }
}

/// Decides whether a freshly connected port hosts the expected device.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Return `Ok(true)` if `interface` talks to the expected device.
    async fn verify(&self, interface: &mut SerialInterface) -> FaultResult<bool>;
}

/// Try every available port until `probe` accepts one.
///
/// Ports that fail to open or error during verification are logged and
/// skipped; discovery only fails once every candidate has been tried.
pub async fn discover(
    template: &SerialConfig,
    opener: Arc<dyn PortOpener>,
    probe: &dyn PortProbe,
    origin: &FaultOrigin,
) -> FaultResult<SerialInterface> {
    let ports = opener
        .available_ports()
        .await
        .map_err(|e| origin.wrap(FaultKind::Connection, "could not enumerate serial ports", e))?;

    for port in ports {
        debug!(port = %port, "trying port");
        let mut candidate = SerialInterface::with_opener(template.for_port(port.clone()), opener.clone());
        if let Err(fault) = candidate.connect().await {
            warn!(port = %port, %fault, "port unavailable, skipping");
            continue;
        }
        match probe.verify(&mut candidate).await {
            Ok(true) => {
                info!(port = %port, "device found");
                return Ok(candidate);
            }
            Ok(false) => debug!(port = %port, "port did not identify"),
            Err(fault) => warn!(port = %port, %fault, "verification failed, skipping"),
        }
        candidate.disconnect().await;
    }

    Err(origin.connection("Could not find a valid port for the device"))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn clean_response(raw: &[u8], last_tx: &[u8], prompt: &str) -> String {
    let mut text = String::from_utf8_lossy(raw).into_owned();
    if !last_tx.is_empty() {
        text = text.replace(String::from_utf8_lossy(last_tx).as_ref(), "");
    }
    if !prompt.is_empty() {
        text = text.replace(prompt, "");
    }
    text.chars()
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace() || *c == '\x0b')
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::mock::MockPortOpener;

    fn quick(port: &str) -> SerialConfig {
        SerialConfig::new(port)
            .with_read_timeout(Duration::from_millis(50))
            .with_write_settle(Duration::ZERO)
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyUSB0")
            .with_baud_rate(9600)
            .with_framing(DataBits::Seven, Parity::Even, StopBits::One)
            .with_flow_control(FlowControl::Hardware)
            .with_eol("\r\n")
            .with_prompt(">>> ");

        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, DataBits::Seven);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.flow_control, FlowControl::Hardware);
        assert_eq!(config.eol, "\r\n");
        assert_eq!(config.for_port("COM3").prompt, ">>> ");
    }

    #[test]
    fn test_clean_response_strips_echo_and_prompt() {
        let raw = b"IN_PV_4\r\n  42.0 4\r\n\x00>>> ";
        let cleaned = clean_response(raw, b"IN_PV_4\r\n", ">>> ");
        assert_eq!(cleaned, "42.0 4");
    }

    #[tokio::test]
    async fn test_communicate_reads_until_prompt() {
        let opener = Arc::new(MockPortOpener::new().with_port("COM5"));
        let mut serial = SerialInterface::with_opener(quick("COM5").with_prompt(">>> "), opener.clone());
        serial.connect().await.unwrap();

        let mut host = opener.take_host("COM5", 1, Duration::from_secs(1)).await.unwrap();
        let device = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = host.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"print('Hi')\r");
            host.write_all(b"print('Hi')\r\nHi\r\n>>> ").await.unwrap();
            host
        });

        let reply = serial.communicate("print('Hi')").await.unwrap();
        let _host = device.await.unwrap();
        assert_eq!(reply, "Hi");
    }

    #[tokio::test]
    async fn test_read_returns_partial_data_after_idle_timeout() {
        let opener = Arc::new(MockPortOpener::new().with_port("COM5"));
        let mut serial = SerialInterface::with_opener(quick("COM5").with_prompt("#"), opener.clone());
        serial.connect().await.unwrap();

        let mut host = opener.take_host("COM5", 1, Duration::from_secs(1)).await.unwrap();
        host.write_all(b"no prompt here").await.unwrap();

        let data = serial.read().await.unwrap();
        assert_eq!(&data[..], b"no prompt here");
    }

    #[tokio::test]
    async fn test_io_while_disconnected_is_connection_fault() {
        let opener = Arc::new(MockPortOpener::new().with_port("COM5"));
        let mut serial = SerialInterface::with_opener(quick("COM5"), opener);
        let err = serial.write_line("STATUS").await.unwrap_err();
        assert_eq!(err.kind, FaultKind::Connection);
        assert_eq!(err.origin, "RS232");
    }

    #[tokio::test]
    async fn test_connect_failure_carries_original_error() {
        let opener = Arc::new(MockPortOpener::new().with_failing_port("COM9"));
        let mut serial = SerialInterface::with_opener(quick("COM9"), opener);
        let err = serial.connect().await.unwrap_err();
        assert_eq!(err.kind, FaultKind::Connection);
        assert!(err.detail.contains("COM9"));
        assert!(err.original.is_some());
        assert!(!serial.is_connected());
    }

    #[tokio::test]
    async fn test_stream_collects_lines_and_rejects_second_start() {
        let opener = Arc::new(MockPortOpener::new().with_port("COM10"));
        let mut serial = SerialInterface::with_opener(quick("COM10"), opener.clone());
        serial.connect().await.unwrap();
        let mut host = opener.take_host("COM10", 1, Duration::from_secs(1)).await.unwrap();

        serial.start_stream(false).await.unwrap();
        let err = serial.start_stream(false).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::Port);

        host.write_all(b"temp=21.5\r\ntemp=21.6\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let capture = serial.stop_stream().await.unwrap();
        assert_eq!(capture.data, "temp=21.5\ntemp=21.6");
        assert!(capture.is_complete());
        assert!(!serial.is_streaming());
        assert!(serial.stop_stream().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_ended_by_port_loss_reports_fault() {
        let opener = Arc::new(MockPortOpener::new().with_port("COM10"));
        let mut serial = SerialInterface::with_opener(quick("COM10"), opener.clone());
        serial.connect().await.unwrap();
        let mut host = opener.take_host("COM10", 1, Duration::from_secs(1)).await.unwrap();

        serial.start_stream(false).await.unwrap();
        host.write_all(b"partial\r\n").await.unwrap();
        drop(host);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!serial.is_streaming());

        let capture = serial.stop_stream().await.unwrap();
        assert_eq!(capture.data, "partial");
        assert!(!capture.is_complete());
        assert_eq!(capture.fault.unwrap().kind, FaultKind::Port);

        // An ended stream does not block the next one
        serial.start_stream(false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!serial.is_streaming());
        serial.start_stream(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_stream_stays_owned_until_collected() {
        let opener = Arc::new(MockPortOpener::new().with_port("COM10"));
        let config = quick("COM10").with_read_timeout(Duration::from_secs(10));
        let mut serial = SerialInterface::with_opener(config, opener.clone()).with_stop_timeout(Duration::from_millis(100));
        serial.connect().await.unwrap();
        let mut host = opener.take_host("COM10", 1, Duration::from_secs(1)).await.unwrap();

        serial.start_stream(false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(serial.stop_stream().await.is_none());
        assert!(serial.is_streaming());
        assert_eq!(serial.start_stream(false).await.unwrap_err().kind, FaultKind::Port);

        host.write_all(b"late\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!serial.is_streaming());
        let capture = serial.stop_stream().await.unwrap();
        assert_eq!(capture.data, "late");
        assert!(capture.is_complete());
    }

    #[tokio::test]
    async fn test_binary_mode_refuses_stream() {
        let opener = Arc::new(MockPortOpener::new().with_port("COM10"));
        let mut serial = SerialInterface::with_opener(quick("COM10").with_binary(true), opener);
        serial.connect().await.unwrap();
        let err = serial.start_stream(true).await.unwrap_err();
        assert_eq!(err.kind, FaultKind::Parameter);
        assert!(!serial.is_streaming());
    }

    #[tokio::test]
    async fn test_save_stream_writes_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.csv");
        let serial = SerialInterface::with_opener(quick("COM1"), Arc::new(MockPortOpener::new()));
        serial.save_stream(&path, "a\nb").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    struct Answers(&'static str);

    #[async_trait]
    impl PortProbe for Answers {
        async fn verify(&self, interface: &mut SerialInterface) -> FaultResult<bool> {
            let reply = interface.read_response().await?;
            Ok(reply.starts_with(self.0))
        }
    }

    #[tokio::test]
    async fn test_discover_skips_failing_ports() {
        let opener = Arc::new(
            MockPortOpener::new()
                .with_failing_port("/dev/ttyUSB0")
                .with_port("/dev/ttyUSB1")
                .with_port("/dev/ttyUSB2")
                .with_script("/dev/ttyUSB1", b"SOMETHING_ELSE\n")
                .with_script("/dev/ttyUSB2", b"NANOSTATION_M v1\n"),
        );
        let origin = FaultOrigin::new("NSTA25M");
        let found = discover(&quick(""), opener.clone(), &Answers("NANOSTATION_M"), &origin)
            .await
            .unwrap();
        assert_eq!(found.config().port, "/dev/ttyUSB2");
        assert!(found.is_connected());
    }

    #[tokio::test]
    async fn test_discover_without_match_is_connection_fault() {
        let opener = Arc::new(MockPortOpener::new().with_port("/dev/ttyUSB1"));
        let origin = FaultOrigin::new("NSTA25M");
        let err = discover(&quick(""), opener, &Answers("NANOSTATION_M"), &origin)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, FaultKind::Connection);
        assert_eq!(err.origin, "NSTA25M");
    }
}
