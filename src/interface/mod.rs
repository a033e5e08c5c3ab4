//! Protocol interface variants.
//!
//! Each variant is a leaf [`Endpoint`](crate::endpoint::Endpoint) that owns one
//! lower-level handle while connected. Equipment and device drivers own exactly
//! one interface and delegate wire-level work to it.

pub mod mock;
pub mod paced_rest;
pub mod rest;
pub mod scpi;
pub mod serial;
pub mod socket;

pub use mock::{MockHandle, MockInterface, MockPortOpener};
pub use paced_rest::{Credential, CredentialSource, PacedRestInterface, RequestPacer};
pub use rest::RestInterface;
pub use scpi::{BusSession, InstrumentBus, ScpiInterface, TcpScpiBus};
pub use serial::{discover, PortOpener, PortProbe, SerialConfig, SerialInterface, StreamCapture, SystemPortOpener};
pub use socket::SocketInterface;
