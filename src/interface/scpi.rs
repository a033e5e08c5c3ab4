//! SCPI instrument interface.
//!
//! Instruments are reached through an [`InstrumentBus`]: something that can list
//! resource strings and open a [`BusSession`] on one of them. `connect` walks the
//! listed resources, asks each for `*IDN?`, and binds the first instrument whose
//! identification contains the expected token.
//!
//! [`TcpScpiBus`] is the production bus for raw SCPI sockets
//! (`TCPIP::<host>::<port>::SOCKET`, usually port 5025).

use crate::endpoint::{Binding, ConnectionState, Endpoint};
use crate::error::{FaultKind, FaultOrigin, FaultResult};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Span};

/// Default raw SCPI socket port.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// Default I/O timeout for a bus session.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Settling delay after `*RST`.
pub const RESET_SETTLE: Duration = Duration::from_secs(5);

/// Open connection to one instrument.
#[async_trait]
pub trait BusSession: Send {
    /// Send one command (terminator added by the session).
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Read one complete response message, including any block header.
    async fn read_raw(&mut self) -> Result<Vec<u8>>;

    /// Close the session.
    async fn close(&mut self) -> Result<()>;
}

/// Enumerates and opens instrument resources.
#[async_trait]
pub trait InstrumentBus: Send + Sync {
    /// Resource strings currently reachable.
    async fn list_resources(&self) -> Result<Vec<String>>;

    /// Open a session on `resource`.
    async fn open(&self, resource: &str) -> Result<Box<dyn BusSession>>;
}

/// Payload of an IEEE 488.2 block (`#<n><len><data>` or `#0<data>\n`).
///
/// Messages that do not start with `#` are returned unchanged, minus a
/// trailing line terminator.
pub fn decode_block(message: &[u8]) -> Result<&[u8]> {
    if message.first() != Some(&b'#') {
        let end = message
            .iter()
            .rposition(|b| *b != b'\n' && *b != b'\r')
            .map_or(0, |i| i + 1);
        return Ok(&message[..end]);
    }

    let digits = message
        .get(1)
        .and_then(|d| (*d as char).to_digit(10))
        .ok_or_else(|| anyhow!("malformed block header"))? as usize;

    if digits == 0 {
        let body = &message[2..];
        let end = body.iter().rposition(|b| *b != b'\n').map_or(0, |i| i + 1);
        return Ok(&body[..end]);
    }

    let header_end = 2 + digits;
    let length: usize = std::str::from_utf8(
        message
            .get(2..header_end)
            .ok_or_else(|| anyhow!("truncated block header"))?,
    )?
    .parse()
    .context("block length is not a number")?;

    message
        .get(header_end..header_end + length)
        .ok_or_else(|| anyhow!("block shorter than declared length {}", length))
}

/// Parse a comma-separated list of numbers.
pub fn parse_ascii_values(text: &str) -> Result<Vec<f64>> {
    text.trim()
        .split(',')
        .filter(|v| !v.trim().is_empty())
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .with_context(|| format!("Failed to parse '{}' as f64", v.trim()))
        })
        .collect()
}

struct BoundInstrument {
    resource: String,
    session: Box<dyn BusSession>,
}

/// SCPI endpoint bound to the first instrument matching an identification token.
pub struct ScpiInterface {
    bus: Arc<dyn InstrumentBus>,
    expected_id: String,
    resource_prefix: Option<String>,
    command_settle: Duration,
    reset_settle: Duration,
    origin: FaultOrigin,
    binding: Binding<BoundInstrument>,
    span: Span,
}

impl ScpiInterface {
    /// Interface that binds the instrument whose `*IDN?` contains `expected_id`.
    pub fn new(bus: Arc<dyn InstrumentBus>, expected_id: impl Into<String>) -> Self {
        let expected_id = expected_id.into();
        let span = info_span!("scpi", expected = %expected_id);
        Self {
            bus,
            expected_id,
            resource_prefix: None,
            command_settle: Duration::from_millis(10),
            reset_settle: RESET_SETTLE,
            origin: FaultOrigin::new("ScpiInterface"),
            binding: Binding::new(),
            span,
        }
    }

    /// Only consider resources starting with `prefix` (e.g. `USB`, `TCPIP`).
    pub fn with_resource_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.resource_prefix = Some(prefix.into());
        self
    }

    /// Pause after each one-way command.
    pub fn with_command_settle(mut self, settle: Duration) -> Self {
        self.command_settle = settle;
        self
    }

    /// Pause after `*RST`.
    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    /// Replace the tracing span this interface logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Resource string of the bound instrument.
    pub fn resource(&self) -> Option<&str> {
        self.binding.get(&self.origin).ok().map(|b| b.resource.as_str())
    }

    fn session(&mut self) -> FaultResult<&mut Box<dyn BusSession>> {
        Ok(&mut self.binding.get_mut(&self.origin)?.session)
    }

    /// Send a one-way command.
    pub async fn send_command(&mut self, command: &str) -> FaultResult<()> {
        debug!(parent: &self.span, command, "write");
        let origin = self.origin.clone();
        self.session()?
            .write(command)
            .await
            .map_err(|e| origin.wrap(FaultKind::Port, format!("failed to send '{}'", command), e))?;
        if !self.command_settle.is_zero() {
            tokio::time::sleep(self.command_settle).await;
        }
        Ok(())
    }

    async fn exchange(&mut self, command: &str) -> FaultResult<Vec<u8>> {
        let origin = self.origin.clone();
        let session = self.session()?;
        session
            .write(command)
            .await
            .map_err(|e| origin.wrap(FaultKind::Port, format!("failed to send '{}'", command), e))?;
        session
            .read_raw()
            .await
            .map_err(|e| origin.wrap(FaultKind::Protocol, format!("no response to '{}'", command), e))
    }

    /// Send a query and return the trimmed text response.
    pub async fn query(&mut self, command: &str) -> FaultResult<String> {
        let raw = self.exchange(command).await?;
        let reply = String::from_utf8_lossy(&raw).trim().to_string();
        debug!(parent: &self.span, command, reply = %reply, "query");
        Ok(reply)
    }

    /// Send a query and parse the comma-separated numeric response.
    pub async fn read_ascii(&mut self, command: &str) -> FaultResult<Vec<f64>> {
        let reply = self.query(command).await?;
        parse_ascii_values(&reply)
            .map_err(|e| self.origin.wrap(FaultKind::Protocol, format!("malformed response to '{}'", command), e))
    }

    /// Send a query and return the binary payload, decoding definite-length blocks.
    pub async fn read_raw(&mut self, command: &str) -> FaultResult<Bytes> {
        let raw = self.exchange(command).await?;
        let payload = decode_block(&raw)
            .map_err(|e| self.origin.wrap(FaultKind::Protocol, format!("malformed block from '{}'", command), e))?;
        debug!(parent: &self.span, command, bytes = payload.len(), "raw read");
        Ok(Bytes::copy_from_slice(payload))
    }

    /// `*IDN?`
    pub async fn get_device_id(&mut self) -> FaultResult<String> {
        self.query("*IDN?").await
    }

    /// `*ESR?`
    pub async fn read_event_register(&mut self) -> FaultResult<u8> {
        let reply = self.query("*ESR?").await?;
        reply
            .parse::<u8>()
            .map_err(|e| self.origin.wrap(FaultKind::Protocol, format!("invalid event register value '{}'", reply), e))
    }

    /// `*ESE`
    pub async fn enable_event_register(&mut self) -> FaultResult<()> {
        self.send_command("*ESE").await
    }

    /// `*CLS`
    pub async fn clear_event_registers(&mut self) -> FaultResult<()> {
        self.send_command("*CLS").await
    }

    /// `*RST`, then wait for the instrument to settle.
    pub async fn reset(&mut self) -> FaultResult<()> {
        self.send_command("*RST").await?;
        tokio::time::sleep(self.reset_settle).await;
        Ok(())
    }

    /// `*TST`
    pub async fn self_test(&mut self) -> FaultResult<()> {
        self.send_command("*TST").await
    }

    /// `*WAI`
    pub async fn wait_pending_operations(&mut self) -> FaultResult<()> {
        self.send_command("*WAI").await
    }

    /// `*OPC`
    pub async fn complete_operations(&mut self) -> FaultResult<()> {
        self.send_command("*OPC").await
    }
}

/// Open `resource` and keep the session if its `*IDN?` reply contains `expected`.
async fn probe_resource(
    bus: &dyn InstrumentBus,
    resource: &str,
    expected: &str,
    span: &Span,
) -> Result<Option<Box<dyn BusSession>>> {
    let mut session = bus.open(resource).await?;
    let identified = match session.write("*IDN?").await {
        Ok(()) => session.read_raw().await,
        Err(e) => Err(e),
    };

    match identified {
        Ok(reply) if String::from_utf8_lossy(&reply).contains(expected) => {
            info!(parent: span, resource, id = %String::from_utf8_lossy(&reply).trim(), "device connected");
            Ok(Some(session))
        }
        other => {
            if let Err(e) = session.close().await {
                debug!(parent: span, resource, error = %e, "close after probe failed");
            }
            other.map(|_| None)
        }
    }
}

#[async_trait]
impl Endpoint for ScpiInterface {
    fn identity(&self) -> &str {
        self.origin.identity()
    }

    fn state(&self) -> ConnectionState {
        self.binding.state()
    }

    async fn bind(&mut self) -> FaultResult<()> {
        info!(parent: &self.span, "connecting");
        let resources = self
            .bus
            .list_resources()
            .await
            .map_err(|e| self.origin.wrap(FaultKind::Connection, "could not list instrument resources", e))?;

        for resource in resources {
            if let Some(prefix) = &self.resource_prefix {
                if !resource.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            match probe_resource(self.bus.as_ref(), &resource, &self.expected_id, &self.span).await {
                Ok(Some(session)) => {
                    self.binding.bind(BoundInstrument { resource, session });
                    return Ok(());
                }
                Ok(None) => debug!(parent: &self.span, resource = %resource, "identification did not match"),
                Err(e) => warn!(parent: &self.span, resource = %resource, error = %format!("{:#}", e), "resource skipped"),
            }
        }

        Err(self.origin.connection(format!(
            "Error connecting to instrument: no resource identifies as '{}'",
            self.expected_id
        )))
    }

    async fn release(&mut self) {
        if let Some(mut bound) = self.binding.take() {
            info!(parent: &self.span, resource = %bound.resource, "disconnecting");
            if let Err(e) = bound.session.close().await {
                warn!(parent: &self.span, error = %e, "error closing instrument session");
            }
        }
    }

    async fn read(&mut self) -> FaultResult<Bytes> {
        let origin = self.origin.clone();
        let raw = self
            .session()?
            .read_raw()
            .await
            .map_err(|e| origin.wrap(FaultKind::Port, "read failed", e))?;
        Ok(Bytes::from(raw))
    }

    async fn write(&mut self, data: &[u8]) -> FaultResult<()> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.send_command(&command).await
    }
}

/// Split `TCPIP[n]::<host>::<port>::SOCKET` into host and port.
pub fn parse_socket_resource(resource: &str) -> Result<(String, u16)> {
    let parts: Vec<&str> = resource.split("::").collect();
    match parts.as_slice() {
        [bus, host, port, "SOCKET"] if bus.starts_with("TCPIP") => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid port in resource: {}", resource))?;
            Ok((host.to_string(), port))
        }
        [bus, host, "SOCKET"] if bus.starts_with("TCPIP") => Ok((host.to_string(), DEFAULT_SCPI_PORT)),
        _ => bail!("Not a raw socket resource: {}", resource),
    }
}

/// Raw SCPI socket bus over a fixed list of resources.
#[derive(Debug, Clone)]
pub struct TcpScpiBus {
    resources: Vec<String>,
    timeout: Duration,
}

impl TcpScpiBus {
    /// Bus exposing `resources`.
    pub fn new(resources: Vec<String>) -> Self {
        Self {
            resources,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Connect and I/O timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl InstrumentBus for TcpScpiBus {
    async fn list_resources(&self) -> Result<Vec<String>> {
        Ok(self.resources.clone())
    }

    async fn open(&self, resource: &str) -> Result<Box<dyn BusSession>> {
        let (host, port) = parse_socket_resource(resource)?;
        let stream = timeout(self.timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .with_context(|| format!("Connection timeout to {}:{}", host, port))?
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
        stream.set_nodelay(true)?;
        debug!(resource, "socket opened");
        Ok(Box::new(TcpSession {
            stream: BufReader::new(stream),
            timeout: self.timeout,
        }))
    }
}

struct TcpSession {
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl TcpSession {
    async fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut message = Vec::new();
        let first = self.stream.read_u8().await.context("Connection closed by device")?;
        message.push(first);

        if first == b'#' {
            let digits_char = self.stream.read_u8().await?;
            message.push(digits_char);
            let digits = (digits_char as char)
                .to_digit(10)
                .ok_or_else(|| anyhow!("malformed block header"))? as usize;
            if digits > 0 {
                let mut length = vec![0u8; digits];
                self.stream.read_exact(&mut length).await?;
                message.extend_from_slice(&length);
                let length: usize = std::str::from_utf8(&length)?.parse()?;
                let mut payload = vec![0u8; length];
                self.stream.read_exact(&mut payload).await?;
                message.extend_from_slice(&payload);
                // Trailing terminator, if the instrument sends one
                if let Ok(buffer) = self.stream.fill_buf().await {
                    if buffer.first() == Some(&b'\n') {
                        self.stream.consume(1);
                    }
                }
                return Ok(message);
            }
        }

        if first != b'\n' {
            self.stream.read_until(b'\n', &mut message).await?;
        }
        Ok(message)
    }
}

#[async_trait]
impl BusSession for TcpSession {
    async fn write(&mut self, command: &str) -> Result<()> {
        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .with_context(|| format!("Failed to write command: {}", command))?;
        stream.flush().await.context("Failed to flush stream")
    }

    async fn read_raw(&mut self) -> Result<Vec<u8>> {
        timeout(self.timeout, self.read_message())
            .await
            .map_err(|_| anyhow!("Timeout waiting for response"))?
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.get_mut().shutdown().await.context("Failed to close socket")
    }
}
