//! Reference driver adapters for connection supervision
//!
//! Two adapters behind the `argus_link` driver contract, one per
//! concurrency model:
//!
//! - [`NvrTcpDriver`] — native-async TCP client for NVR-style controllers
//!   that push newline-delimited JSON events after a token handshake
//! - [`BlockingSourceDriver`] — runs a synchronous source (local capture
//!   SDKs whose native calls cannot run on a cooperative loop) on a
//!   dedicated OS thread and marshals its events back through a channel
//!
//! Real protocol stacks (WebSocket controllers, MQTT brokers, tunnel
//! subprocesses) implement the same contract; the supervisor does not know
//! the difference.

mod blocking;
mod tcp;

pub use blocking::{BlockingSource, BlockingSourceDriver};
pub use tcp::{NvrTcpConfig, NvrTcpDriver, NVR_DEFAULT_PORT};
