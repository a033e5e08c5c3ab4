//! Capability contract shared by every device, equipment and interface driver.
//!
//! The contract is the operation set `{connect, disconnect, is_connected, read,
//! write}` plus the two-state connection lifecycle:
//!
//! ```text
//! Disconnected --connect ok--> Connected
//! Connected    --disconnect--> Disconnected
//! Connected    --connect-----> Disconnected --> Connected   (self-healing)
//! any connect failure leaves Disconnected
//! ```
//!
//! Implementors supply [`Endpoint::bind`] and [`Endpoint::release`]; the provided
//! [`Endpoint::connect`] performs a full disconnect first when the endpoint is
//! already connected, so no physical resource is ever bound twice.

use crate::error::{Fault, FaultOrigin, FaultResult};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

/// Lifecycle state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No resource is held.
    #[default]
    Disconnected,
    /// The endpoint exclusively owns its lower-level handle.
    Connected,
}

/// Exclusive slot for an endpoint's lower-level handle.
///
/// The handle is present exactly while the endpoint is connected. [`Binding::take`]
/// hands it out once for release; a second call returns `None`, so teardown can
/// never release the same handle twice.
#[derive(Debug)]
pub struct Binding<H> {
    handle: Option<H>,
}

impl<H> Default for Binding<H> {
    fn default() -> Self {
        Self { handle: None }
    }
}

impl<H> Binding<H> {
    /// Empty (disconnected) binding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state derived from handle presence.
    pub fn state(&self) -> ConnectionState {
        if self.handle.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// True while a handle is held.
    pub fn is_bound(&self) -> bool {
        self.handle.is_some()
    }

    /// Store a freshly acquired handle. Any previous handle is returned to the
    /// caller so it can be released.
    pub fn bind(&mut self, handle: H) -> Option<H> {
        self.handle.replace(handle)
    }

    /// Remove the handle for release.
    pub fn take(&mut self) -> Option<H> {
        self.handle.take()
    }

    /// Borrow the handle, or fail with a Connection fault from `origin`.
    pub fn get(&self, origin: &FaultOrigin) -> FaultResult<&H> {
        self.handle
            .as_ref()
            .ok_or_else(|| origin.connection("not connected"))
    }

    /// Mutably borrow the handle, or fail with a Connection fault from `origin`.
    pub fn get_mut(&mut self, origin: &FaultOrigin) -> FaultResult<&mut H> {
        self.handle
            .as_mut()
            .ok_or_else(|| origin.connection("not connected"))
    }
}

/// The capability contract every driver implements.
#[async_trait]
pub trait Endpoint: Send {
    /// Identity stamped on this endpoint's faults and log records.
    fn identity(&self) -> &str;

    /// Protocol / driver version tag.
    fn version(&self) -> &str {
        "0.1"
    }

    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// True while connected.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Acquire the underlying resource. On failure the endpoint must remain
    /// disconnected with nothing partially bound.
    async fn bind(&mut self) -> FaultResult<()>;

    /// Release the underlying resource. Never fails; teardown problems are logged.
    async fn release(&mut self);

    /// Connect, first disconnecting if already connected.
    async fn connect(&mut self) -> FaultResult<()> {
        if self.is_connected() {
            debug!(endpoint = self.identity(), "already connected, reconnecting");
            self.disconnect().await;
        }
        self.bind().await
    }

    /// Disconnect. Idempotent; always ends disconnected.
    async fn disconnect(&mut self) {
        if self.is_connected() {
            self.release().await;
        }
    }

    /// Read whatever the endpoint has to offer.
    async fn read(&mut self) -> FaultResult<Bytes> {
        Err(unsupported(self.identity(), "read"))
    }

    /// Write raw data to the endpoint.
    async fn write(&mut self, data: &[u8]) -> FaultResult<()> {
        let _ = data;
        Err(unsupported(self.identity(), "write"))
    }
}

fn unsupported(identity: &str, operation: &str) -> Fault {
    FaultOrigin::new(identity).protocol(format!("{} is not supported by this endpoint", operation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;

    struct Probe {
        origin: FaultOrigin,
        binding: Binding<u32>,
        next_handle: u32,
        released: Vec<u32>,
        fail_bind: bool,
    }

    impl Probe {
        fn new() -> Self {
            Self {
                origin: FaultOrigin::new("probe"),
                binding: Binding::new(),
                next_handle: 1,
                released: Vec::new(),
                fail_bind: false,
            }
        }
    }

    #[async_trait]
    impl Endpoint for Probe {
        fn identity(&self) -> &str {
            self.origin.identity()
        }

        fn state(&self) -> ConnectionState {
            self.binding.state()
        }

        async fn bind(&mut self) -> FaultResult<()> {
            if self.fail_bind {
                return Err(self.origin.connection("resource unavailable"));
            }
            let handle = self.next_handle;
            self.next_handle += 1;
            assert!(self.binding.bind(handle).is_none(), "double bind");
            Ok(())
        }

        async fn release(&mut self) {
            if let Some(handle) = self.binding.take() {
                self.released.push(handle);
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_releases_previous_handle_first() {
        let mut probe = Probe::new();
        probe.connect().await.unwrap();
        probe.connect().await.unwrap();
        assert!(probe.is_connected());
        assert_eq!(probe.released, vec![1]);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut probe = Probe::new();
        probe.disconnect().await;
        probe.connect().await.unwrap();
        probe.disconnect().await;
        probe.disconnect().await;
        assert!(!probe.is_connected());
        assert_eq!(probe.released, vec![1]);
    }

    #[tokio::test]
    async fn test_failed_connect_stays_disconnected() {
        let mut probe = Probe::new();
        probe.connect().await.unwrap();
        probe.fail_bind = true;
        let err = probe.connect().await.unwrap_err();
        assert_eq!(err.kind, FaultKind::Connection);
        assert_eq!(probe.state(), ConnectionState::Disconnected);
        assert_eq!(probe.released, vec![1]);
    }

    #[tokio::test]
    async fn test_default_read_write_are_protocol_faults() {
        let mut probe = Probe::new();
        let err = probe.read().await.unwrap_err();
        assert_eq!(err.kind, FaultKind::Protocol);
        assert_eq!(err.origin, "probe");
        assert!(probe.write(b"x").await.is_err());
    }

    #[test]
    fn test_binding_take_once() {
        let mut binding = Binding::new();
        binding.bind("port");
        assert_eq!(binding.take(), Some("port"));
        assert_eq!(binding.take(), None);
        let origin = FaultOrigin::new("b");
        assert!(binding.get(&origin).is_err());
    }
}
