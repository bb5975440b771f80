//! Error taxonomy for connection supervision
//!
//! Every failure a driver reports carries an [`ErrorKind`] so the supervisor
//! can decide severity without inspecting protocol details. Transient kinds
//! are retried silently; credential kinds are retried too (an operator may
//! fix credentials while the process keeps running) but surface at `Error`
//! severity so UIs can prompt for reconfiguration.

use crate::ConnectionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classified failure kind, assigned by the driver before an error crosses
/// the supervisor boundary. Anything a driver cannot classify is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Endpoint rejected the credentials.
    AuthError,
    /// TLS negotiation or certificate validation failed.
    TlsError,
    /// Endpoint could not be reached (refused, reset, no route).
    Unreachable,
    /// Operation exceeded its deadline.
    Timeout,
    /// Unclassified failure; logged and retried like a transient one.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthError => "auth_error",
            ErrorKind::TlsError => "tls_error",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Credential-class failures are surfaced at `Error` severity so a UI
    /// can distinguish them from ordinary flakiness.
    pub fn is_credential(&self) -> bool {
        matches!(self, ErrorKind::AuthError | ErrorKind::TlsError)
    }

    /// Transient failures are retried via backoff with no escalation.
    pub fn is_transient(&self) -> bool {
        !self.is_credential()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a [`crate::ConnectionDriver`].
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthError, message)
    }

    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TlsError, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unreachable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Classify a raw io error into the supervisor's taxonomy.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match err.kind() {
            IoKind::ConnectionRefused
            | IoKind::ConnectionReset
            | IoKind::ConnectionAborted
            | IoKind::NotConnected
            | IoKind::AddrNotAvailable => ErrorKind::Unreachable,
            IoKind::TimedOut | IoKind::WouldBlock => ErrorKind::Timeout,
            IoKind::PermissionDenied => ErrorKind::AuthError,
            _ => ErrorKind::Unknown,
        };
        Self::new(kind, format!("{}: {}", context, err))
    }
}

/// Discovery cache lookup errors.
///
/// Callers must be able to distinguish "no data yet" from "data temporarily
/// unavailable", so both carry the key that missed.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The connection is down (or the refresh failed) and no prior entry
    /// exists for this key.
    #[error("no cached data for '{resource_key}' on connection '{connection_id}'")]
    NoData {
        connection_id: ConnectionId,
        resource_key: String,
    },

    /// The refresh call failed and no prior entry exists to fall back on.
    #[error("refresh of '{resource_key}' failed with no cached fallback: {source}")]
    RefreshFailed {
        resource_key: String,
        source: DriverError,
    },
}

/// Top-level errors for supervisor and registry operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection '{0}' is not managed by this registry")]
    NotManaged(ConnectionId),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Result type for supervision operations.
pub type LinkResult<T> = Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classes() {
        assert!(ErrorKind::AuthError.is_credential());
        assert!(ErrorKind::TlsError.is_credential());
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::Unreachable.is_transient());
        assert!(ErrorKind::Unknown.is_transient());
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::auth("token rejected by controller");
        assert_eq!(err.to_string(), "auth_error: token rejected by controller");
        assert_eq!(err.kind, ErrorKind::AuthError);
    }

    #[test]
    fn test_io_classification() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            DriverError::from_io("connect", &refused).kind,
            ErrorKind::Unreachable
        );

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(
            DriverError::from_io("read", &timed_out).kind,
            ErrorKind::Timeout
        );

        let other = std::io::Error::new(std::io::ErrorKind::InvalidData, "garbled");
        assert_eq!(
            DriverError::from_io("read", &other).kind,
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::NoData {
            connection_id: ConnectionId::new("nvr-1"),
            resource_key: "cameras".to_string(),
        };
        assert!(err.to_string().contains("cameras"));
        assert!(err.to_string().contains("nvr-1"));
    }
}
