//! Error taxonomy for oxbow
//!
//! Every component boundary translates provider- or transport-specific
//! failures into an [`Error`] carrying an [`ErrorKind`]. Layers dispatch on
//! the kind: launchers suppress `Unavailable` types, the scheduler marks
//! tasks lost on `Network`, retry loops only ever retry `Temporary`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type used throughout oxbow.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an error, deciding how outer layers react to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Programmer or configuration error. Never retried at any layer.
    Fatal,
    /// Capacity, spot, or instance-type unavailability. Triggers TTL-based
    /// suppression and fallback to on-demand.
    Unavailable,
    /// Transient failure, retried with backoff and jitter.
    Temporary,
    /// Task-level I/O failure; marks the task lost.
    Network,
    /// The referenced object does not exist.
    NotExist,
    /// The operation is not supported by the implementation (used by
    /// repository and direct-transfer paths).
    NotSupported,
    /// The operation was canceled. Propagated, never retried.
    Canceled,
    /// The request cannot be satisfied by the largest instance type.
    ResourcesExhausted,
    /// Anything else.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Fatal => "fatal",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Temporary => "temporary",
            ErrorKind::Network => "network",
            ErrorKind::NotExist => "not exist",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Canceled => "canceled",
            ErrorKind::ResourcesExhausted => "resources exhausted",
            ErrorKind::Other => "error",
        };
        write!(f, "{s}")
    }
}

/// An error with a kind and an optional cause chain.
///
/// Errors are cheap to clone so they can be fanned out to multiple waiters
/// (e.g. every task on an alloc whose keepalive failed).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Box<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), cause: None }
    }

    /// Wrap `cause`, preserving its message chain under a new kind/context.
    pub fn wrap(kind: ErrorKind, message: impl Into<String>, cause: Error) -> Self {
        Self { kind, message: message.into(), cause: Some(Box::new(cause)) }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Temporary, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn not_exist(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotExist, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn resources_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourcesExhausted, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this error or any error in its cause chain has kind `kind`.
    pub fn is(&self, kind: ErrorKind) -> bool {
        if self.kind == kind {
            return true;
        }
        self.cause.as_ref().is_some_and(|c| c.is(kind))
    }

    /// The full `message: cause: cause...` chain as one string.
    pub fn chain(&self) -> String {
        let mut s = format!("{}: {}", self.kind, self.message);
        let mut cur = self.cause.as_deref();
        while let Some(e) = cur {
            s.push_str(": ");
            s.push_str(&e.message);
            cur = e.cause.as_deref();
        }
        s
    }

    pub fn retryable(&self) -> bool {
        self.kind == ErrorKind::Temporary
    }
}
