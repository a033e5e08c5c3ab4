//! UART-attached device under test.
//!
//! Wraps a [`SerialInterface`] in stream mode: start reading, let the test
//! exercise the device, stop, then inspect or save what it printed.

use crate::endpoint::{ConnectionState, Endpoint};
use crate::error::{FaultOrigin, FaultResult};
use crate::interface::serial::{PortOpener, SerialConfig, SerialInterface, SystemPortOpener};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, info_span, warn, Span};

/// Serial device with stream capture.
pub struct SerialDevice {
    name: String,
    device_id: String,
    interface: SerialInterface,
    data: Option<String>,
    origin: FaultOrigin,
    span: Span,
}

impl SerialDevice {
    /// Device labelled `name` on a real port.
    pub fn new(name: impl Into<String>, config: SerialConfig) -> Self {
        Self::with_opener(name, config, Arc::new(SystemPortOpener))
    }

    /// Device whose port is opened by `opener`.
    pub fn with_opener(name: impl Into<String>, config: SerialConfig, opener: Arc<dyn PortOpener>) -> Self {
        let name = name.into();
        let span = info_span!("device", name = %name, port = %config.port);
        Self {
            interface: SerialInterface::with_opener(config, opener).with_span(span.clone()),
            origin: FaultOrigin::new(name.clone()),
            name,
            device_id: String::new(),
            data: None,
            span,
        }
    }

    /// Platform identifier of the device.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Device label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Platform identifier, empty if unset.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Begin capturing console output.
    pub async fn read_serial_data_start(&mut self, timestamps: bool) -> FaultResult<()> {
        info!(parent: &self.span, "started reading data");
        self.interface
            .start_stream(timestamps)
            .await
            .map_err(|f| self.origin.adopt(f))
    }

    /// Stop capturing and keep what was received.
    ///
    /// A stream cut short by a port error keeps its partial output and
    /// returns the fault. A stream that did not stop in time is a Port fault;
    /// calling again collects it once it has drained.
    pub async fn read_serial_data_stop(&mut self) -> FaultResult<()> {
        let Some(capture) = self.interface.stop_stream().await else {
            if self.interface.is_streaming() {
                return Err(self.origin.port("serial stream did not stop in time"));
            }
            self.data = None;
            info!(parent: &self.span, captured = false, "stopped reading data");
            return Ok(());
        };
        info!(parent: &self.span, captured = true, complete = capture.is_complete(), "stopped reading data");
        self.data = Some(capture.data);
        match capture.fault {
            Some(fault) => Err(self.origin.adopt(fault)),
            None => Ok(()),
        }
    }

    /// Output of the last capture.
    pub fn serial_data(&self) -> Option<&str> {
        if self.data.is_none() {
            warn!(parent: &self.span, "no serial data available");
        }
        self.data.as_deref()
    }

    /// Write the last capture to `path`, one line per record.
    pub async fn save_serial_data(&self, path: &Path) -> FaultResult<()> {
        match &self.data {
            Some(data) => self
                .interface
                .save_stream(path, data)
                .await
                .map_err(|f| self.origin.adopt(f)),
            None => {
                warn!(parent: &self.span, "no data available to save");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Endpoint for SerialDevice {
    fn identity(&self) -> &str {
        self.origin.identity()
    }

    fn state(&self) -> ConnectionState {
        self.interface.state()
    }

    async fn bind(&mut self) -> FaultResult<()> {
        info!(parent: &self.span, "establishing connection");
        self.interface.connect().await.map_err(|f| self.origin.adopt(f))
    }

    async fn release(&mut self) {
        info!(parent: &self.span, "disconnecting");
        self.interface.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;
    use crate::interface::mock::MockPortOpener;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_stream_capture_and_save() {
        let opener = Arc::new(MockPortOpener::new().with_port("COM10"));
        let config = SerialConfig::new("COM10").with_read_timeout(Duration::from_millis(20));
        let mut device = SerialDevice::with_opener("HATI", config, opener.clone()).with_device_id("M9RDJA");
        device.connect().await.unwrap();
        let mut host = opener.take_host("COM10", 1, Duration::from_secs(1)).await.unwrap();

        assert!(device.serial_data().is_none());
        device.read_serial_data_start(true).await.unwrap();
        host.write_all(b"boot ok\r\nfix acquired\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        device.read_serial_data_stop().await.unwrap();

        let data = device.serial_data().unwrap().to_string();
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("] boot ok"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serial_data.csv");
        device.save_serial_data(&path).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        device.disconnect().await;
        assert!(!device.is_connected());
    }

    #[tokio::test]
    async fn test_port_loss_during_stream_keeps_partial_data_and_faults() {
        let opener = Arc::new(MockPortOpener::new().with_port("COM10"));
        let config = SerialConfig::new("COM10").with_read_timeout(Duration::from_millis(20));
        let mut device = SerialDevice::with_opener("HATI", config, opener.clone());
        device.connect().await.unwrap();
        let mut host = opener.take_host("COM10", 1, Duration::from_secs(1)).await.unwrap();

        device.read_serial_data_start(false).await.unwrap();
        host.write_all(b"boot ok\r\n").await.unwrap();
        drop(host);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = device.read_serial_data_stop().await.unwrap_err();
        assert_eq!(err.kind, FaultKind::Port);
        assert_eq!(err.origin, "HATI");
        assert_eq!(device.serial_data(), Some("boot ok"));
    }

    #[tokio::test]
    async fn test_stream_before_connect_is_restamped() {
        let opener = Arc::new(MockPortOpener::new().with_port("COM10"));
        let mut device = SerialDevice::with_opener("HATI", SerialConfig::new("COM10"), opener);
        let err = device.read_serial_data_start(false).await.unwrap_err();
        assert_eq!(err.origin, "HATI");
    }
}
