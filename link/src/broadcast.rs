//! Status fan-out for supervisor lifecycle events
//!
//! Best-effort broadcast to current subscribers over a `tokio::sync::broadcast`
//! channel. There is no acknowledgement and no durable log: a subscriber that
//! joins late reads the latest retained value per connection id via
//! [`StatusBroadcaster::latest`], not history, and a subscriber that falls
//! behind by more than the buffer size receives `Lagged` and skips ahead.
//!
//! High-frequency sub-resource signals (individual cameras flapping behind
//! one controller) are debounced: an unchanged online/offline state for the
//! same `(connection_id, resource_id)` is suppressed within a configurable
//! window. The window resets only when a publish actually goes out, not on
//! every incoming signal.

use crate::{ConnectionId, ConnectionState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

/// Default broadcast buffer size.
///
/// Sized for bursts like a controller dropping with dozens of cameras behind
/// it; slow subscribers past this depth get `Lagged` and skip to current.
pub const DEFAULT_STATUS_BUFFER_SIZE: usize = 256;

/// Default debounce window for sub-resource online/offline signals.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

/// Lifecycle status of one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub connection_id: ConnectionId,
    pub status: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Online state of one sub-resource behind a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceEvent {
    pub connection_id: ConnectionId,
    pub resource_id: String,
    pub is_online: bool,
}

/// Tagged payload of one broadcast message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BroadcastPayload {
    ConnectionStatus(StatusEvent),
    ResourceStatus(ResourceEvent),
}

/// Wire-shaped envelope pushed to subscribers:
/// `{ "type": ..., "data": {...}, "timestamp": ISO-8601 }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastMessage {
    #[serde(flatten)]
    pub payload: BroadcastPayload,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastMessage {
    fn now(payload: BroadcastPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Broadcast channel depth (default: [`DEFAULT_STATUS_BUFFER_SIZE`]).
    pub buffer_size: usize,
    /// Debounce window for unchanged sub-resource states (default: 5s).
    /// The reference deployments use different windows per transport, so
    /// this is a parameter, not a constant.
    pub debounce_window: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_STATUS_BUFFER_SIZE,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
        }
    }
}

struct DebounceEntry {
    last_value: bool,
    last_publish: Instant,
}

struct BroadcasterInner {
    tx: broadcast::Sender<BroadcastMessage>,
    config: BroadcasterConfig,
    /// Latest status per connection id, served to late joiners.
    retained: RwLock<HashMap<ConnectionId, BroadcastMessage>>,
    /// Last actually-published value per (connection, resource).
    debounce: RwLock<HashMap<(ConnectionId, String), DebounceEntry>>,
}

/// Shared fan-out of lifecycle and sub-resource events.
///
/// The subscriber set is the only state shared across all supervisors'
/// tasks; cloning the broadcaster shares it.
#[derive(Clone)]
pub struct StatusBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

impl StatusBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        let (tx, _) = broadcast::channel(config.buffer_size.max(1));
        Self {
            inner: Arc::new(BroadcasterInner {
                tx,
                config,
                retained: RwLock::new(HashMap::new()),
                debounce: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to future messages. Pair with [`Self::latest`] to seed a
    /// new subscriber with the current state of every connection.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.inner.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// Latest retained status message per connection id.
    pub async fn latest(&self) -> Vec<BroadcastMessage> {
        self.inner.retained.read().await.values().cloned().collect()
    }

    /// Latest retained status for one connection id.
    pub async fn latest_for(&self, connection_id: &ConnectionId) -> Option<BroadcastMessage> {
        self.inner.retained.read().await.get(connection_id).cloned()
    }

    /// Publish a lifecycle status event. Returns the number of subscribers
    /// it was delivered to (0 when nobody is listening; that is not an
    /// error).
    pub async fn publish(&self, event: StatusEvent) -> usize {
        let message = BroadcastMessage::now(BroadcastPayload::ConnectionStatus(event.clone()));
        self.inner
            .retained
            .write()
            .await
            .insert(event.connection_id.clone(), message.clone());
        match self.inner.tx.send(message) {
            Ok(delivered) => delivered,
            Err(_) => 0,
        }
    }

    /// Publish a sub-resource online/offline signal, suppressing an
    /// unchanged value inside the debounce window. Returns the delivered
    /// count, 0 when suppressed or unheard.
    pub async fn publish_resource(&self, event: ResourceEvent) -> usize {
        let key = (event.connection_id.clone(), event.resource_id.clone());
        let window = self.inner.config.debounce_window;
        let now = Instant::now();

        {
            let mut debounce = self.inner.debounce.write().await;
            if let Some(entry) = debounce.get(&key) {
                if entry.last_value == event.is_online
                    && now.duration_since(entry.last_publish) < window
                {
                    tracing::debug!(
                        "suppressing duplicate resource state for {}/{} (is_online={})",
                        event.connection_id,
                        event.resource_id,
                        event.is_online
                    );
                    return 0;
                }
            }
            // Window timestamp moves only when a publish actually occurs.
            debounce.insert(
                key,
                DebounceEntry {
                    last_value: event.is_online,
                    last_publish: now,
                },
            );
        }

        let message = BroadcastMessage::now(BroadcastPayload::ResourceStatus(event));
        match self.inner.tx.send(message) {
            Ok(delivered) => delivered,
            Err(_) => 0,
        }
    }

    /// Drop retained status and debounce state for a removed connection.
    pub async fn forget(&self, connection_id: &ConnectionId) {
        self.inner.retained.write().await.remove(connection_id);
        self.inner
            .debounce
            .write()
            .await
            .retain(|(id, _), _| id != connection_id);
    }
}
