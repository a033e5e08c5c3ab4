//! IKA KS 130 orbital lab shaker over RS-232.
//!
//! The shaker speaks the IKA NAMUR-style command set at 9600 baud, 7E1 with
//! RTS/CTS. Remote mode is switched on with `START_4` after connecting and off
//! with `STOP_4` before the port is released.

use crate::endpoint::{ConnectionState, Endpoint};
use crate::error::{FaultOrigin, FaultResult};
use crate::interface::serial::{
    DataBits, FlowControl, Parity, PortOpener, SerialConfig, SerialInterface, StopBits, SystemPortOpener,
};
use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{info, info_span, warn, Span};

/// Speeds the shaker accepts, in rpm. `0` stops the motor.
pub const SPEED_RANGE: RangeInclusive<u32> = 0..=800;

/// Longest name `OUT_NAME` stores.
pub const MAX_NAME_LEN: usize = 6;

/// Name of a negative status code reported by `STATUS`.
pub fn error_name(code: i32) -> &'static str {
    match code {
        -1 => "GEN_ERR",
        -2 => "NO_COMM",
        -3 => "HIGH_TEMP",
        -4 => "MOTOR_OVERLOAD",
        -9 => "VALUE_ERR",
        -41 => "TRIAC_DEV_ERR",
        -42 => "SAFETY_DEV_ERR",
        -83 => "WRONG_PARITY",
        -84 => "UNKNOWN_INSTR",
        -85 => "WRONG_INSTR_SEQ",
        -86 => "INV_RATED_VAL",
        -87 => "INSUFF_STORAGE",
        _ => "UNKNOWN_ERROR_CODE",
    }
}

/// Serial settings the KS 130 requires.
pub fn shaker_serial_config(port: impl Into<String>) -> SerialConfig {
    SerialConfig::new(port)
        .with_baud_rate(9600)
        .with_framing(DataBits::Seven, Parity::Even, StopBits::One)
        .with_flow_control(FlowControl::Hardware)
        .with_eol("\r\n")
}

/// IKA KS 130 driver.
pub struct LabShaker {
    interface: SerialInterface,
    origin: FaultOrigin,
    span: Span,
}

impl LabShaker {
    /// Shaker on a real port.
    pub fn new(port: impl Into<String>) -> Self {
        Self::with_opener(shaker_serial_config(port), Arc::new(SystemPortOpener))
    }

    /// Shaker whose port is opened by `opener`.
    pub fn with_opener(config: SerialConfig, opener: Arc<dyn PortOpener>) -> Self {
        let span = info_span!("shaker", port = %config.port);
        let interface = SerialInterface::with_opener(config, opener).with_span(span.clone());
        Self {
            interface,
            origin: FaultOrigin::new("IKAKS130"),
            span,
        }
    }

    async fn send(&mut self, command: &str) -> FaultResult<()> {
        self.interface.write_line(command).await.map_err(|f| self.origin.adopt(f))
    }

    async fn ask(&mut self, command: &str) -> FaultResult<String> {
        self.interface.communicate(command).await.map_err(|f| self.origin.adopt(f))
    }

    /// Run at `rpm`. Out-of-range speeds are rejected before anything is sent.
    pub async fn start_shaking(&mut self, rpm: u32) -> FaultResult<()> {
        if !SPEED_RANGE.contains(&rpm) {
            return Err(self.origin.parameter(format!(
                "speed {} rpm out of range {}..={}",
                rpm,
                SPEED_RANGE.start(),
                SPEED_RANGE.end()
            )));
        }
        info!(parent: &self.span, rpm, "start shaking");
        self.send(&format!("OUT_SP_4 {}", rpm)).await
    }

    /// Set speed to zero.
    pub async fn stop(&mut self) -> FaultResult<()> {
        info!(parent: &self.span, "stop shaking");
        self.send("OUT_SP_4 0").await
    }

    /// Actual speed (`IN_PV_4`).
    pub async fn read_real_value(&mut self) -> FaultResult<String> {
        self.ask("IN_PV_4").await
    }

    /// Speed set point (`IN_SP_4`).
    pub async fn read_set_value(&mut self) -> FaultResult<String> {
        self.ask("IN_SP_4").await
    }

    /// Speed limit (`IN_SP_6`).
    pub async fn read_set_range(&mut self) -> FaultResult<String> {
        self.ask("IN_SP_6").await
    }

    /// Device status. A negative status code is a Protocol fault naming the error.
    pub async fn read_dev_status(&mut self) -> FaultResult<String> {
        let status = self.ask("STATUS").await?;
        if let Some(code) = status.split_whitespace().next().and_then(|s| s.parse::<i32>().ok()) {
            if code < 0 {
                return Err(self
                    .origin
                    .protocol(format!("device reported {} ({})", error_name(code), code)));
            }
        }
        Ok(status)
    }

    /// Device type (`IN_TYPE`).
    pub async fn read_dev_type(&mut self) -> FaultResult<String> {
        self.ask("IN_TYPE").await
    }

    /// Device name (`IN_NAME`).
    pub async fn read_dev_name(&mut self) -> FaultResult<String> {
        self.ask("IN_NAME").await
    }

    /// Store a device name, truncated to six characters.
    pub async fn write_dev_name(&mut self, name: &str) -> FaultResult<()> {
        let name: String = name.chars().take(MAX_NAME_LEN).collect();
        self.send(&format!("OUT_NAME {}", name)).await
    }

    /// Reset the controller (`RESET`).
    pub async fn reset_device(&mut self) -> FaultResult<()> {
        self.send("RESET").await
    }
}

#[async_trait]
impl Endpoint for LabShaker {
    fn identity(&self) -> &str {
        self.origin.identity()
    }

    fn state(&self) -> ConnectionState {
        self.interface.state()
    }

    async fn bind(&mut self) -> FaultResult<()> {
        if let Err(fault) = self.interface.connect().await {
            let config = self.interface.config();
            return Err(self.origin.could_not_connect(
                format!(
                    "Error connecting to RS232 interface via port: {}, baudrate: {}",
                    config.port, config.baud_rate
                ),
                &fault,
            ));
        }
        if let Err(fault) = self.send("START_4").await {
            self.interface.disconnect().await;
            return Err(fault);
        }
        Ok(())
    }

    async fn release(&mut self) {
        if let Err(fault) = self.send("STOP_4").await {
            warn!(parent: &self.span, %fault, "could not leave remote mode");
        }
        self.interface.disconnect().await;
    }
}
