//! Devices under test.

pub mod serial_device;

pub use serial_device::SerialDevice;
