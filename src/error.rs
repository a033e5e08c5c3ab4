//! Fault types for the test bench.
//!
//! Every public endpoint operation either succeeds or returns a [`Fault`]. A fault
//! is a single tagged value rather than a family of per-driver error types, so the
//! orchestration layer can report failures from a heterogeneous fleet of drivers
//! without knowing their internals.
//!
//! ## Fault Kinds
//!
//! - **`Connection`**: a resource could not be opened or bound, or an instrument
//!   bus probe found no matching device. Also returned when `read`/`write` is
//!   attempted on a disconnected endpoint.
//! - **`Parameter`**: the caller supplied an invalid command argument. These are
//!   raised before any transport I/O and never touch hardware state.
//! - **`Protocol`**: the remote end answered with a non-success or malformed
//!   response.
//! - **`Port`**: an I/O failure in the middle of a session, e.g. during a
//!   capture loop.
//!
//! ## Origin
//!
//! Each driver builds a [`FaultOrigin`] from its own identity at construction and
//! raises every fault through it. When a driver receives a fault from the
//! interface it owns, [`FaultOrigin::adopt`] re-stamps it with the driver's
//! identity and keeps the lower-level message in [`Fault::original`].

use std::fmt;
use thiserror::Error;

/// Convenience alias for results carrying a [`Fault`].
pub type FaultResult<T> = std::result::Result<T, Fault>;

/// Category of a [`Fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Resource could not be opened or bound.
    Connection,
    /// Invalid command argument, detected before any I/O.
    Parameter,
    /// Remote end returned a non-success or malformed response.
    Protocol,
    /// I/O failure in the middle of a session.
    Port,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FaultKind::Connection => "connection",
            FaultKind::Parameter => "parameter",
            FaultKind::Protocol => "protocol",
            FaultKind::Port => "port",
        };
        write!(f, "{}", label)
    }
}

/// HTTP response details attached to REST protocol faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDetail {
    /// Status code, e.g. `404`.
    pub status: u16,
    /// Canonical reason phrase, e.g. `Not Found`.
    pub reason: String,
    /// Raw response body.
    pub body: String,
}

/// A failure raised by an endpoint, stamped with the identity of the raising driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{origin}: {kind} fault: {detail}{}", original_suffix(.original))]
pub struct Fault {
    /// Category of the failure.
    pub kind: FaultKind,
    /// Identity of the driver instance that raised the fault.
    pub origin: String,
    /// Human-readable description.
    pub detail: String,
    /// Lower-level error text, verbatim, when this fault wraps one.
    pub original: Option<String>,
    /// HTTP status, reason and body for REST protocol faults.
    pub response: Option<ResponseDetail>,
}

fn original_suffix(original: &Option<String>) -> String {
    match original {
        Some(text) if !text.is_empty() => format!(" (caused by: {})", text),
        _ => String::new(),
    }
}

impl Fault {
    /// Create a fault without a wrapped lower-level error.
    pub fn new(kind: FaultKind, origin: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            origin: origin.into(),
            detail: detail.into(),
            original: None,
            response: None,
        }
    }

    /// Attach the verbatim text of a lower-level error.
    pub fn with_original(mut self, original: impl Into<String>) -> Self {
        self.original = Some(original.into());
        self
    }

    /// Attach HTTP response details.
    pub fn with_response(mut self, response: ResponseDetail) -> Self {
        self.response = Some(response);
        self
    }

    /// HTTP status code, if this fault carries a response.
    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }

    /// True if the fault is of the given kind.
    pub fn is(&self, kind: FaultKind) -> bool {
        self.kind == kind
    }
}

/// Fault factory bound to one driver identity.
///
/// Built once per driver at construction; every fault the driver raises goes
/// through it, so the origin is always the raising driver and never a shared
/// base layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultOrigin {
    identity: String,
}

impl FaultOrigin {
    /// Bind a fault factory to `identity`.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    /// Identity stamped on every fault from this factory.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// A fault of `kind` with no wrapped error.
    pub fn fault(&self, kind: FaultKind, detail: impl Into<String>) -> Fault {
        Fault::new(kind, self.identity.clone(), detail)
    }

    /// Resource could not be opened or bound.
    pub fn connection(&self, detail: impl Into<String>) -> Fault {
        self.fault(FaultKind::Connection, detail)
    }

    /// Invalid command argument.
    pub fn parameter(&self, detail: impl Into<String>) -> Fault {
        self.fault(FaultKind::Parameter, detail)
    }

    /// Non-success or malformed response.
    pub fn protocol(&self, detail: impl Into<String>) -> Fault {
        self.fault(FaultKind::Protocol, detail)
    }

    /// Mid-session I/O failure.
    pub fn port(&self, detail: impl Into<String>) -> Fault {
        self.fault(FaultKind::Port, detail)
    }

    /// A fault of `kind` wrapping a lower-level error; the alternate `Display`
    /// form is used so `anyhow` context chains are kept intact.
    pub fn wrap(
        &self,
        kind: FaultKind,
        detail: impl Into<String>,
        err: impl fmt::Display,
    ) -> Fault {
        self.fault(kind, detail).with_original(format!("{:#}", err))
    }

    /// Re-stamp a fault raised by a lower layer with this identity.
    ///
    /// The kind and response details are preserved; the inner fault's message
    /// becomes `original`. Faults already carrying this identity pass through.
    pub fn adopt(&self, inner: Fault) -> Fault {
        if inner.origin == self.identity {
            return inner;
        }
        let original = inner.to_string();
        Fault {
            kind: inner.kind,
            origin: self.identity.clone(),
            detail: inner.detail,
            original: Some(original),
            response: inner.response,
        }
    }

    /// Connection fault with a driver-specific message, keeping the interface's
    /// fault text as `original`.
    pub fn could_not_connect(&self, detail: impl Into<String>, inner: &Fault) -> Fault {
        self.connection(detail).with_original(inner.to_string())
    }
}
