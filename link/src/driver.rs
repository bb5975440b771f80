//! Driver contract
//!
//! Defines the interface every protocol adapter must implement. The
//! supervisor owns lifecycle and retry; the driver owns everything
//! protocol-specific: how to connect, how to wait for the next event, how
//! to tear down, and how to classify failures into the shared taxonomy.
//!
//! The contract is deliberately transport- and concurrency-agnostic: a
//! native-async network client and a blocking-thread capture source (results
//! marshalled back through a channel) both fit behind it without duplicating
//! supervisor logic. Optional behavior is declared through
//! [`DriverCapabilities`] flags rather than probed at runtime.

use crate::error::{DriverError, ErrorKind};
use async_trait::async_trait;

/// One message from a live connection.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Opaque protocol payload, passed through to supervisor subscribers
    /// without interpretation.
    Message(String),
    /// A sub-resource behind this connection (e.g. one camera behind a
    /// controller) changed online state. Routed through the debounced
    /// resource broadcast.
    ResourceOnline {
        resource_id: String,
        is_online: bool,
    },
}

/// Explicit capability flags for a driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// The driver emits [`DriverEvent::ResourceOnline`] signals for
    /// sub-resources behind the connection.
    pub reports_resource_status: bool,
}

/// A live connection handle produced by [`ConnectionDriver::connect`].
///
/// The event sequence ends (with `None` or an error) exactly when the
/// connection is lost; the supervisor treats either as a disconnect.
#[async_trait]
pub trait DriverSession: Send {
    /// Wait for the next event. Returns `None` when the stream ends cleanly,
    /// `Some(Err(..))` when the connection breaks.
    async fn next_event(&mut self) -> Option<Result<DriverEvent, DriverError>>;

    /// Best-effort teardown. Idempotent, and must never fail on an
    /// already-dead handle.
    async fn disconnect(&mut self);
}

impl std::fmt::Debug for dyn DriverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DriverSession")
    }
}

/// Protocol-specific adapter consumed by the supervisor.
///
/// `connect()` is called repeatedly across reconnects, so implementations
/// hold configuration, not connection state.
#[async_trait]
pub trait ConnectionDriver: Send + Sync {
    /// Short label used in logs ("nvr-tcp", "mqtt", "tunnel", ...).
    fn name(&self) -> &str;

    /// Declared optional behavior.
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::default()
    }

    /// Establish a connection. Failures must arrive pre-classified; the
    /// supervisor runs this under its own deadline as well.
    async fn connect(&self) -> Result<Box<dyn DriverSession>, DriverError>;

    /// Map an error to its kind. The default trusts the classification the
    /// driver embedded when constructing the error; anything a driver failed
    /// to classify is already `Unknown`.
    fn classify(&self, error: &DriverError) -> ErrorKind {
        error.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    #[async_trait]
    impl ConnectionDriver for NullDriver {
        fn name(&self) -> &str {
            "null"
        }

        async fn connect(&self) -> Result<Box<dyn DriverSession>, DriverError> {
            Err(DriverError::unreachable("nothing listens here"))
        }
    }

    #[tokio::test]
    async fn test_default_capabilities_and_classify() {
        let driver = NullDriver;
        assert!(!driver.capabilities().reports_resource_status);

        let err = driver.connect().await.unwrap_err();
        assert_eq!(driver.classify(&err), ErrorKind::Unreachable);

        let unclassified = DriverError::unknown("driver forgot to classify");
        assert_eq!(driver.classify(&unclassified), ErrorKind::Unknown);
    }
}
