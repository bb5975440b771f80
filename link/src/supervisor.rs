//! Connection supervisor
//!
//! Owns one connection's lifecycle: connect under a deadline, stream events
//! through a listener, and on any failure consult the backoff policy and
//! retry. All state transitions for a connection id pass through its single
//! run task, so no two states are ever simultaneously "true" for the same
//! id and a `Connected` can never be observed after a later `Disconnected`.
//!
//! State machine:
//!
//! ```text
//! Disconnected --start()--> Connecting
//! Connecting --connect ok--> Connected
//! Connecting --connect fails--> Reconnecting
//! Connected --listener ends--> Reconnecting
//! Reconnecting --backoff elapses--> Connecting
//! Reconnecting --failures past threshold--> Error (still retrying)
//! <any state> --stop()--> Disconnected
//! ```

use crate::backoff::BackoffPolicy;
use crate::broadcast::{ResourceEvent, StatusBroadcaster, StatusEvent};
use crate::driver::{ConnectionDriver, DriverEvent, DriverSession};
use crate::error::{DriverError, ErrorKind};
use crate::{ConnectionId, ConnectionState, SupervisorConfig};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Buffer depth for the per-connection driver event fan-out.
const DRIVER_EVENT_BUFFER_SIZE: usize = 256;

/// Read-only state exposed to callers, written exclusively by the
/// supervisor's run task.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub is_connected: bool,
    pub last_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Consecutive failed attempts since the last success. Advances only
    /// while retrying; reset to zero the instant a connect succeeds.
    pub reconnect_attempt_count: u32,
    /// Delay currently being waited out before the next attempt.
    pub current_retry_delay: Option<Duration>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            is_connected: false,
            last_error: None,
            last_connected_at: None,
            reconnect_attempt_count: 0,
            current_retry_delay: None,
        }
    }
}

/// Supervises one connection to an unreliable external endpoint.
///
/// Many supervisors run fully independently; nothing here is shared across
/// instances except the [`StatusBroadcaster`] handed in at construction.
pub struct ConnectionSupervisor {
    id: ConnectionId,
    driver: Arc<dyn ConnectionDriver>,
    config: SupervisorConfig,
    policy: BackoffPolicy,
    broadcaster: StatusBroadcaster,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    snapshot: Arc<RwLock<StatusSnapshot>>,
    event_tx: broadcast::Sender<DriverEvent>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        id: ConnectionId,
        driver: Arc<dyn ConnectionDriver>,
        config: SupervisorConfig,
        policy: BackoffPolicy,
        broadcaster: StatusBroadcaster,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(DRIVER_EVENT_BUFFER_SIZE);
        Self {
            id,
            driver,
            config,
            policy,
            broadcaster,
            state_tx: Arc::new(state_tx),
            state_rx,
            snapshot: Arc::new(RwLock::new(StatusSnapshot::default())),
            event_tx,
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current state snapshot. Queryable at any point, including mid-outage.
    pub async fn status(&self) -> StatusSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Watch the connection state. The discovery cache uses this to decide
    /// whether a refresh is worth attempting.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to the opaque driver events this connection produces.
    pub fn subscribe_events(&self) -> broadcast::Receiver<DriverEvent> {
        self.event_tx.subscribe()
    }

    /// Whether the background run task is alive.
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Start supervising. Returns `true` if the first connect attempt
    /// succeeded, `false` if the supervisor went straight into the retry
    /// loop. The background task keeps running either way; a second call
    /// while running is a no-op.
    pub async fn start(&self) -> bool {
        let mut task_guard = self.task.lock().await;
        if task_guard.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            tracing::warn!("supervisor for '{}' already running", self.id);
            return self.snapshot.read().await.is_connected;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (first_tx, first_rx) = oneshot::channel();

        let ctx = RunCtx {
            id: self.id.clone(),
            driver: self.driver.clone(),
            config: self.config.clone(),
            policy: self.policy.clone(),
            broadcaster: self.broadcaster.clone(),
            state_tx: self.state_tx.clone(),
            snapshot: self.snapshot.clone(),
            event_tx: self.event_tx.clone(),
        };

        *task_guard = Some(tokio::spawn(ctx.run(shutdown_rx, first_tx)));
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        drop(task_guard);

        first_rx.await.unwrap_or(false)
    }

    /// Stop supervising: cancel the listener and any pending backoff sleep,
    /// await the run task up to `grace_timeout`, and transition to
    /// `Disconnected`. Always returns within the grace period; a run task
    /// that cannot wind down in time is aborted.
    pub async fn stop(&self, grace_timeout: Duration) {
        let shutdown = self.shutdown_tx.lock().await.take();
        let handle = self.task.lock().await.take();
        let Some(mut handle) = handle else {
            return;
        };
        if let Some(tx) = shutdown {
            let _ = tx.send(());
        }

        if timeout(grace_timeout, &mut handle).await.is_err() {
            tracing::warn!(
                "supervisor for '{}' did not stop within {:?}, abandoning its task",
                self.id,
                grace_timeout
            );
            handle.abort();
            // The abandoned task can no longer record the final state.
            {
                let mut snap = self.snapshot.write().await;
                snap.state = ConnectionState::Disconnected;
                snap.is_connected = false;
                snap.current_retry_delay = None;
            }
            self.state_tx.send_replace(ConnectionState::Disconnected);
            self.broadcaster
                .publish(StatusEvent {
                    connection_id: self.id.clone(),
                    status: ConnectionState::Disconnected,
                    error: None,
                })
                .await;
        }
    }
}

enum ListenOutcome {
    Shutdown,
    StreamEnded,
    StreamError(DriverError),
}

/// Everything the run task owns. The task is the single writer for the
/// connection's state; the supervisor only reads.
struct RunCtx {
    id: ConnectionId,
    driver: Arc<dyn ConnectionDriver>,
    config: SupervisorConfig,
    policy: BackoffPolicy,
    broadcaster: StatusBroadcaster,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    snapshot: Arc<RwLock<StatusSnapshot>>,
    event_tx: broadcast::Sender<DriverEvent>,
}

impl RunCtx {
    async fn run(
        mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
        first_tx: oneshot::Sender<bool>,
    ) {
        let mut first_tx = Some(first_tx);
        'main: loop {
            self.transition(ConnectionState::Connecting, None).await;

            let attempt = tokio::select! {
                result = timeout(self.config.connect_timeout(), self.driver.connect()) => {
                    Some(result)
                }
                _ = &mut shutdown_rx => None,
            };
            let Some(result) = attempt else {
                break 'main;
            };

            let failure = match result {
                Ok(Ok(mut session)) => {
                    self.policy.reset();
                    self.on_connected().await;
                    if let Some(tx) = first_tx.take() {
                        let _ = tx.send(true);
                    }

                    let outcome = self.listen(session.as_mut(), &mut shutdown_rx).await;

                    // Best-effort teardown, bounded so a dead endpoint
                    // cannot stall the retry loop or shutdown.
                    let _ = timeout(self.config.disconnect_timeout(), session.disconnect()).await;

                    match outcome {
                        ListenOutcome::Shutdown => break 'main,
                        ListenOutcome::StreamEnded => {
                            DriverError::unknown("event stream ended")
                        }
                        ListenOutcome::StreamError(e) => e,
                    }
                }
                Ok(Err(e)) => e,
                Err(_) => DriverError::timeout(format!(
                    "connect for '{}' exceeded {:?}",
                    self.id,
                    self.config.connect_timeout()
                )),
            };

            if let Some(tx) = first_tx.take() {
                let _ = tx.send(false);
            }

            let kind = self.driver.classify(&failure);
            let delay = self.policy.advance();
            self.on_retry(kind, &failure, delay).await;

            tokio::select! {
                _ = sleep(delay) => {}
                _ = &mut shutdown_rx => break 'main,
            }
        }

        self.transition(ConnectionState::Disconnected, None).await;
    }

    /// Consume session events until the stream ends, breaks, or stop() is
    /// requested.
    async fn listen(
        &self,
        session: &mut dyn DriverSession,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> ListenOutcome {
        loop {
            tokio::select! {
                event = session.next_event() => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => {
                        tracing::warn!("listener for '{}' broke: {}", self.id, e);
                        return ListenOutcome::StreamError(e);
                    }
                    None => {
                        tracing::info!("event stream for '{}' ended", self.id);
                        return ListenOutcome::StreamEnded;
                    }
                },
                _ = &mut *shutdown_rx => return ListenOutcome::Shutdown,
            }
        }
    }

    async fn handle_event(&self, event: DriverEvent) {
        if let DriverEvent::ResourceOnline {
            resource_id,
            is_online,
        } = &event
        {
            self.broadcaster
                .publish_resource(ResourceEvent {
                    connection_id: self.id.clone(),
                    resource_id: resource_id.clone(),
                    is_online: *is_online,
                })
                .await;
        }
        // Fan out to this connection's subscribers; nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    async fn on_connected(&self) {
        {
            let mut snap = self.snapshot.write().await;
            snap.state = ConnectionState::Connected;
            snap.is_connected = true;
            snap.last_error = None;
            snap.last_connected_at = Some(Utc::now());
            snap.reconnect_attempt_count = 0;
            snap.current_retry_delay = None;
        }
        self.state_tx.send_replace(ConnectionState::Connected);
        tracing::info!(
            "connection '{}' established via driver '{}'",
            self.id,
            self.driver.name()
        );
        self.broadcaster
            .publish(StatusEvent {
                connection_id: self.id.clone(),
                status: ConnectionState::Connected,
                error: None,
            })
            .await;
    }

    async fn on_retry(&self, kind: ErrorKind, failure: &DriverError, delay: Duration) {
        let attempts = self.policy.attempt();
        // Error is a severity flag, not a halt: credential-class failures
        // and long streaks surface it while retrying continues.
        let state = if kind.is_credential() || attempts > self.config.error_threshold {
            ConnectionState::Error
        } else {
            ConnectionState::Reconnecting
        };

        {
            let mut snap = self.snapshot.write().await;
            snap.state = state;
            snap.is_connected = false;
            snap.last_error = Some(failure.to_string());
            snap.reconnect_attempt_count = attempts;
            snap.current_retry_delay = Some(delay);
        }
        self.state_tx.send_replace(state);

        if state == ConnectionState::Error {
            tracing::error!(
                "connection '{}' failing ({}), attempt {} in {:?}: {}",
                self.id,
                kind,
                attempts + 1,
                delay,
                failure
            );
        } else {
            tracing::warn!(
                "connection '{}' lost, retry {} in {:?}: {}",
                self.id,
                attempts + 1,
                delay,
                failure
            );
        }

        self.broadcaster
            .publish(StatusEvent {
                connection_id: self.id.clone(),
                status: state,
                error: Some(failure.to_string()),
            })
            .await;
    }

    async fn transition(&self, state: ConnectionState, error: Option<String>) {
        {
            let mut snap = self.snapshot.write().await;
            snap.state = state;
            snap.is_connected = state.is_connected();
            if error.is_some() {
                snap.last_error = error.clone();
            }
            if state == ConnectionState::Disconnected {
                snap.current_retry_delay = None;
            }
        }
        self.state_tx.send_replace(state);
        tracing::debug!("connection '{}' -> {}", self.id, state);
        self.broadcaster
            .publish(StatusEvent {
                connection_id: self.id.clone(),
                status: state,
                error,
            })
            .await;
    }
}
