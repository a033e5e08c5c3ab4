//! # HIL Bench Core Library
//!
//! Building blocks for hardware-in-the-loop test stations: a uniform endpoint
//! contract for lab equipment and devices under test, the protocol interfaces
//! they talk through, and a background logger that records serial telemetry
//! while a test drives the bench.
//!
//! ## Crate Structure
//!
//! - **`endpoint`**: The `Endpoint` trait and the connect/disconnect state machine every
//!   driver shares.
//! - **`error`**: The `Fault` type. Every fault names the driver instance that raised it.
//! - **`interface`**: Protocol variants: serial, REST, rate-limited REST, SCPI, raw TCP,
//!   plus in-memory doubles for tests.
//! - **`capture`**: The line capture loop shared by the logger and serial stream mode.
//! - **`logger`**: `TelemetryLogger`, recording a serial console to a CSV file on its own task.
//! - **`equipment`**: Drivers for bench equipment (lab shaker, robot arm).
//! - **`devices`**: Drivers for devices under test.
//! - **`config`**: Figment-based station configuration (TOML + environment).
//! - **`tracing_setup`**: Subscriber installation for binaries and test harnesses.
//!
//! ## Example
//! ```no_run
//! use hil_bench::equipment::LabShaker;
//! use hil_bench::endpoint::Endpoint;
//!
//! # async fn run() -> hil_bench::error::FaultResult<()> {
//! let mut shaker = LabShaker::new("/dev/ttyUSB0");
//! shaker.connect().await?;
//! shaker.start_shaking(600).await?;
//! shaker.stop().await?;
//! shaker.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod devices;
pub mod endpoint;
pub mod equipment;
pub mod error;
pub mod interface;
pub mod logger;
pub mod tracing_setup;

pub use endpoint::{ConnectionState, Endpoint};
pub use error::{Fault, FaultKind, FaultOrigin, FaultResult};
pub use logger::{StopOutcome, TelemetryLogger};
