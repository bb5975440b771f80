//! Supervisor registry
//!
//! Owns N concurrent supervisors keyed by connection id. The registry is an
//! explicit instance constructed once at startup and passed by reference
//! into request handlers; there are no module-level connection maps.

use crate::backoff::BackoffPolicy;
use crate::broadcast::StatusBroadcaster;
use crate::driver::ConnectionDriver;
use crate::supervisor::{ConnectionSupervisor, StatusSnapshot};
use crate::{ConnectionId, SupervisorConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Registry of supervisors, one per configured endpoint.
pub struct SupervisorRegistry {
    broadcaster: StatusBroadcaster,
    default_config: SupervisorConfig,
    supervisors: RwLock<HashMap<ConnectionId, Arc<ConnectionSupervisor>>>,
}

impl SupervisorRegistry {
    pub fn new(broadcaster: StatusBroadcaster) -> Self {
        Self::with_config(broadcaster, SupervisorConfig::default())
    }

    pub fn with_config(broadcaster: StatusBroadcaster, default_config: SupervisorConfig) -> Self {
        Self {
            broadcaster,
            default_config,
            supervisors: RwLock::new(HashMap::new()),
        }
    }

    /// The shared status fan-out all managed supervisors publish through.
    pub fn broadcaster(&self) -> &StatusBroadcaster {
        &self.broadcaster
    }

    /// Start supervising `connection_id` with the registry's default config
    /// and backoff. No-op returning `false` if the id is already managed.
    pub async fn add(&self, connection_id: ConnectionId, driver: Arc<dyn ConnectionDriver>) -> bool {
        self.add_with(
            connection_id,
            driver,
            self.default_config.clone(),
            BackoffPolicy::default(),
        )
        .await
    }

    /// Start supervising with per-connection config and backoff (different
    /// drivers legitimately want different caps).
    pub async fn add_with(
        &self,
        connection_id: ConnectionId,
        driver: Arc<dyn ConnectionDriver>,
        config: SupervisorConfig,
        policy: BackoffPolicy,
    ) -> bool {
        let supervisor = {
            let mut supervisors = self.supervisors.write().await;
            if supervisors.contains_key(&connection_id) {
                tracing::debug!("connection '{}' already managed, ignoring add", connection_id);
                return false;
            }
            let supervisor = Arc::new(ConnectionSupervisor::new(
                connection_id.clone(),
                driver,
                config,
                policy,
                self.broadcaster.clone(),
            ));
            supervisors.insert(connection_id.clone(), supervisor.clone());
            supervisor
        };

        tracing::info!("supervising connection '{}'", connection_id);
        supervisor.start().await;
        true
    }

    /// Stop and discard one supervisor, along with its retained status and
    /// debounce state. Returns `false` if the id was not managed.
    pub async fn remove(&self, connection_id: &ConnectionId) -> bool {
        let removed = self.supervisors.write().await.remove(connection_id);
        let Some(supervisor) = removed else {
            return false;
        };
        tracing::info!("removing connection '{}'", connection_id);
        supervisor.stop(self.default_config.grace_timeout()).await;
        self.broadcaster.forget(connection_id).await;
        true
    }

    /// Access one managed supervisor (for status queries, event
    /// subscriptions, or building a discovery cache off its state watch).
    pub async fn supervisor(&self, connection_id: &ConnectionId) -> Option<Arc<ConnectionSupervisor>> {
        self.supervisors.read().await.get(connection_id).cloned()
    }

    /// Status snapshot for one managed connection.
    pub async fn status_of(&self, connection_id: &ConnectionId) -> Option<StatusSnapshot> {
        let supervisor = self.supervisor(connection_id).await?;
        Some(supervisor.status().await)
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.supervisors.read().await.keys().cloned().collect()
    }

    pub async fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.supervisors.read().await.contains_key(connection_id)
    }

    pub async fn len(&self) -> usize {
        self.supervisors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.supervisors.read().await.is_empty()
    }

    /// Stop every managed supervisor concurrently, waiting up to `timeout`.
    /// A supervisor whose teardown hangs past the deadline is abandoned,
    /// not awaited; the owning process is exiting and nothing depends on
    /// its cleanup completing.
    pub async fn shutdown_all(&self, timeout: Duration) {
        let drained: Vec<(ConnectionId, Arc<ConnectionSupervisor>)> =
            self.supervisors.write().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!("shutting down {} supervised connection(s)", drained.len());

        let mut handles = Vec::with_capacity(drained.len());
        for (id, supervisor) in drained {
            handles.push(tokio::spawn(async move {
                supervisor.stop(timeout).await;
                id
            }));
        }

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                let stopped = results.iter().filter(|r| r.is_ok()).count();
                tracing::info!("shutdown complete, {} supervisor(s) stopped", stopped);
            }
            Err(_) => {
                tracing::warn!(
                    "shutdown deadline of {:?} reached, abandoning remaining supervisors",
                    timeout
                );
            }
        }
    }
}
