//! In-memory test doubles.
//!
//! [`MockInterface`] is a loopback endpoint: writes accumulate in a buffer that
//! `read` hands back, unless a scripted reply is queued. Every call is recorded
//! on a shared [`MockHandle`] so tests can check ordering after the endpoint has
//! been moved into a driver.
//!
//! [`MockPortOpener`] stands in for real serial ports, handing out one end of a
//! `tokio::io::duplex` pair per open and keeping the other end for the test.

use crate::endpoint::{Binding, ConnectionState, Endpoint};
use crate::error::{FaultOrigin, FaultResult};
use crate::interface::serial::{DynSerial, PortOpener, SerialConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tracing::info;

/// Call record shared between a [`MockInterface`] and the test that drives it.
#[derive(Debug, Default)]
struct MockState {
    events: Vec<String>,
    writes: Vec<Bytes>,
    replies: VecDeque<Bytes>,
    loopback: Vec<u8>,
}

/// Test-side view of a [`MockInterface`].
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    fail_next_connect: Arc<AtomicBool>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the log from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn log(&self, event: impl Into<String>) {
        self.lock().events.push(event.into());
    }

    /// Ordered call log: `connect`, `disconnect`, `write`, `read`.
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    /// Number of log entries equal to `event`.
    pub fn count(&self, event: &str) -> usize {
        self.lock().events.iter().filter(|e| *e == event).count()
    }

    /// Every payload written, in order.
    pub fn writes(&self) -> Vec<Bytes> {
        self.lock().writes.clone()
    }

    /// Written payloads decoded as UTF-8.
    pub fn written_text(&self) -> Vec<String> {
        self.lock()
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Queue a reply for the next `read`.
    pub fn push_reply(&self, reply: impl Into<Bytes>) {
        self.lock().replies.push_back(reply.into());
    }

    /// Make the next `connect` fail with a Connection fault.
    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }
}

/// Loopback endpoint for exercising drivers without hardware.
pub struct MockInterface {
    origin: FaultOrigin,
    binding: Binding<()>,
    handle: MockHandle,
    write_latency: Duration,
}

impl MockInterface {
    /// Mock with identity `DummyInterface`.
    pub fn new() -> Self {
        Self::named("DummyInterface")
    }

    /// Mock with a custom identity.
    pub fn named(identity: impl Into<String>) -> Self {
        Self {
            origin: FaultOrigin::new(identity),
            binding: Binding::new(),
            handle: MockHandle::default(),
            write_latency: Duration::ZERO,
        }
    }

    /// Simulated delay after every write.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    /// Shared call log and control handle.
    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl Default for MockInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Endpoint for MockInterface {
    fn identity(&self) -> &str {
        self.origin.identity()
    }

    fn state(&self) -> ConnectionState {
        self.binding.state()
    }

    async fn bind(&mut self) -> FaultResult<()> {
        if self.handle.fail_next_connect.swap(false, Ordering::SeqCst) {
            self.handle.log("connect-failed");
            return Err(self.origin.connection("simulated connection failure"));
        }
        info!(endpoint = self.identity(), "connecting");
        self.binding.bind(());
        self.handle.lock().loopback.clear();
        self.handle.log("connect");
        Ok(())
    }

    async fn release(&mut self) {
        info!(endpoint = self.identity(), "disconnecting");
        self.binding.take();
        self.handle.log("disconnect");
    }

    async fn read(&mut self) -> FaultResult<Bytes> {
        self.binding.get(&self.origin)?;
        let mut state = self.handle.lock();
        state.events.push("read".into());
        match state.replies.pop_front() {
            Some(reply) => Ok(reply),
            None => Ok(Bytes::copy_from_slice(&state.loopback)),
        }
    }

    async fn write(&mut self, data: &[u8]) -> FaultResult<()> {
        self.binding.get(&self.origin)?;
        {
            let mut state = self.handle.lock();
            state.events.push("write".into());
            state.writes.push(Bytes::copy_from_slice(data));
            state.loopback.extend_from_slice(data);
        }
        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }
        Ok(())
    }
}

#[derive(Default)]
struct OpenerState {
    ports: Vec<String>,
    failing: HashSet<String>,
    scripts: HashMap<String, Vec<u8>>,
    opens: HashMap<String, usize>,
    hosts: HashMap<(String, usize), DuplexStream>,
}

/// Serial port opener backed by in-memory duplex links.
///
/// Open index `n` (1-based) of a port leaves its host side available through
/// [`MockPortOpener::take_host`].
#[derive(Clone)]
pub struct MockPortOpener {
    state: Arc<Mutex<OpenerState>>,
    buffer: usize,
}

impl MockPortOpener {
    /// Opener with no ports.
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            buffer: 4096,
        }
    }

    /// Duplex buffer size per link.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, OpenerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an openable port.
    pub fn with_port(self, name: &str) -> Self {
        {
            let mut state = self.lock();
            if !state.ports.iter().any(|p| p == name) {
                state.ports.push(name.to_string());
            }
        }
        self
    }

    /// Add a listed port whose open always fails.
    pub fn with_failing_port(self, name: &str) -> Self {
        let opener = self.with_port(name);
        opener.set_failing(name, true);
        opener
    }

    /// Bytes written to the host side of every new link on `name`.
    pub fn with_script(self, name: &str, script: &[u8]) -> Self {
        self.lock().scripts.insert(name.to_string(), script.to_vec());
        self
    }

    /// Toggle open failure for `name`.
    pub fn set_failing(&self, name: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(name.to_string());
        } else {
            state.failing.remove(name);
        }
    }

    /// Successful opens of `name` so far.
    pub fn open_count(&self, name: &str) -> usize {
        self.lock().opens.get(name).copied().unwrap_or(0)
    }

    /// Wait up to `limit` for the host side of the `index`-th open of `name`.
    pub async fn take_host(&self, name: &str, index: usize, limit: Duration) -> Option<DuplexStream> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let host = self.lock().hosts.remove(&(name.to_string(), index));
            if let Some(host) = host {
                return Some(host);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for MockPortOpener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortOpener for MockPortOpener {
    async fn open(&self, config: &SerialConfig) -> Result<DynSerial> {
        let (index, script) = {
            let mut state = self.lock();
            if !state.ports.iter().any(|p| *p == config.port) {
                return Err(anyhow!("No such file or directory: {}", config.port));
            }
            if state.failing.contains(&config.port) {
                return Err(anyhow!("Device or resource busy: {}", config.port));
            }
            let count = state.opens.entry(config.port.clone()).or_insert(0);
            *count += 1;
            (*count, state.scripts.get(&config.port).cloned())
        };

        let (mut host, device) = tokio::io::duplex(self.buffer);
        if let Some(script) = script {
            host.write_all(&script).await?;
        }
        self.lock().hosts.insert((config.port.clone(), index), host);
        Ok(Box::new(device))
    }

    async fn available_ports(&self) -> Result<Vec<String>> {
        Ok(self.lock().ports.clone())
    }
}
