//! Connection supervision for unreliable external endpoints
//!
//! Keeps long-lived connections to NVR controllers, broker clients, and
//! outbound tunnels alive so the rest of the platform never has to.
//!
//! ## Features
//!
//! - One supervisor task per connection with a strict state machine
//! - Exponential backoff with per-driver caps and optional jitter
//! - Pluggable driver contract (native-async and blocking-thread adapters)
//! - Latched status fan-out with debounced sub-resource signals
//! - TTL discovery cache with stale-on-failure fallback
//! - Registry owning N supervisors with bounded concurrent shutdown
//!
//! A supervisor never parses protocol data; WebSocket framing, MQTT packet
//! encoding, and video decoding all live behind [`ConnectionDriver`].

mod backoff;
mod broadcast;
mod cache;
mod driver;
mod error;
mod registry;
mod supervisor;

pub use backoff::BackoffPolicy;
pub use broadcast::{
    BroadcastMessage, BroadcastPayload, BroadcasterConfig, ResourceEvent, StatusBroadcaster,
    StatusEvent, DEFAULT_STATUS_BUFFER_SIZE,
};
pub use cache::{CacheLookup, DiscoveryCache};
pub use driver::{ConnectionDriver, DriverCapabilities, DriverEvent, DriverSession};
pub use error::{CacheError, DriverError, ErrorKind, LinkError, LinkResult};
pub use registry::SupervisorRegistry;
pub use supervisor::{ConnectionSupervisor, StatusSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque stable key for one managed connection.
///
/// This is the identity of the owning configuration row; exactly one
/// supervisor exists per id at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle state of one managed connection.
///
/// Exactly one state is current per [`ConnectionId`]; all transitions pass
/// through the connection's single owning task. `Error` is a severity flag
/// (too many consecutive failures, or a credential-class failure), not a
/// halt — the supervisor keeps retrying while in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }

    /// Whether the connection is live (a listener is consuming events).
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether the supervisor is between attempts and will retry.
    pub fn is_retrying(&self) -> bool {
        matches!(self, ConnectionState::Reconnecting | ConnectionState::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeout configuration for supervisor operations.
///
/// Drivers can hang on unresponsive endpoints, so every suspension point the
/// supervisor owns runs under one of these bounds.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum time for one `driver.connect()` attempt (default: 30 seconds).
    pub connect_timeout_secs: u64,
    /// Default grace period for `stop()` to await the run task before
    /// abandoning it (default: 5 seconds).
    pub grace_timeout_secs: u64,
    /// Bound on the best-effort `disconnect()` after a listener ends
    /// (default: 5 seconds). A dead endpoint must not stall the retry loop.
    pub disconnect_timeout_secs: u64,
    /// Consecutive failures after which `Reconnecting` is reported as
    /// `Error` severity (default: 5). Retrying continues either way.
    pub error_threshold: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            grace_timeout_secs: 5,
            disconnect_timeout_secs: 5,
            error_threshold: 5,
        }
    }
}

impl SupervisorConfig {
    /// Get the connect timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get the stop grace timeout as a Duration
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout_secs)
    }

    /// Get the disconnect bound as a Duration
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }
}
