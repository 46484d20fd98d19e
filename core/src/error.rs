//! Error taxonomy shared by every virta component
//!
//! Errors are classified by *kind*, not by origin: a driver, a broker and a
//! processor all report a throttled upstream the same way. Wrappers such as
//! `retry` and `drop_on` dispatch on these kinds to convert failures into
//! alternative outcomes.

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type that flows through acknowledgements and driver calls.
///
/// Cloneable by design: a single failure may be surfaced to several
/// observers (the producing input, a retry wrapper, the logs).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid or rejected configuration, surfaced before a stream runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// The driver has no live connection to its target.
    ///
    /// Producing components treat this as transient: back off and retry.
    #[error("not connected to target source or sink")]
    NotConnected,

    /// A deadline expired or the surrounding context was cancelled.
    #[error("action timed out")]
    Timeout,

    /// A retryable upstream failure (throttling, 5xx, network reset).
    #[error("transient error: {0}")]
    Transient(String),

    /// A non-retryable upstream failure (validation, auth, malformed data).
    #[error("permanent error: {0}")]
    Permanent(String),

    /// A named resource was not found in the registry.
    ///
    /// Distinct from operational failures of the resource itself: the lookup
    /// missed, not the operation.
    #[error("unable to locate resource: {0}")]
    ResourceMissing(String),

    /// A cache `add` hit an existing key.
    #[error("key already exists")]
    KeyAlreadyExists,

    /// A cache lookup missed.
    #[error("key does not exist")]
    KeyNotFound,

    /// A `drop_on` back-pressure deadline expired before the child accepted.
    #[error("experienced back pressure beyond: {}ms", .0.as_millis())]
    BackPressure(Duration),

    /// The component below closed its channel. A signal, not a failure.
    #[error("type was closed")]
    Shutdown,

    /// An underlying I/O failure, stringified to keep the type cloneable.
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// Whether a retry wrapper should consider another attempt worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NotConnected | Error::Transient(_) | Error::Io(_)
        )
    }

    /// Whether this error came from cancellation or deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Whether this signals orderly teardown rather than a failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Permanent(format!("invalid document: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::NotConnected.is_transient());
        assert!(Error::Transient("503".into()).is_transient());
        assert!(!Error::Permanent("401".into()).is_transient());
        assert!(!Error::Timeout.is_transient());
    }

    #[test]
    fn timeout_and_shutdown_are_distinct() {
        assert!(Error::Timeout.is_timeout());
        assert!(!Error::Timeout.is_shutdown());
        assert!(Error::Shutdown.is_shutdown());
        assert!(!Error::Shutdown.is_timeout());
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn back_pressure_display() {
        let err = Error::BackPressure(Duration::from_millis(100));
        assert_eq!(err.to_string(), "experienced back pressure beyond: 100ms");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
