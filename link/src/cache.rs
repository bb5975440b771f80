//! Discovery cache
//!
//! Enumerating the sub-resources behind a connection (the cameras behind a
//! controller, the topics behind a broker) is expensive and only possible
//! while the connection is up. This cache serves those lookups with TTL
//! semantics and degrades to stale data instead of failing outright:
//!
//! - fresh hit: cached payload, no refresh call;
//! - miss while the connection is down: most recent stale entry with a
//!   warning, and the refresh is never attempted (calling into a known-dead
//!   connection wastes a retry slot and risks hanging);
//! - miss while up: refresh; on failure fall back to the stale entry, or
//!   report an explicit "no data" error when none exists.
//!
//! One cache per connection id; there is no cross-connection contention.

use crate::error::{CacheError, DriverError};
use crate::{ConnectionId, ConnectionState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

struct CacheEntry<T> {
    payload: T,
    cached_at: DateTime<Utc>,
    stored: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self) -> bool {
        self.stored.elapsed() < self.ttl
    }
}

/// Result of one cache lookup.
///
/// `cached=false` means the payload came from a refresh call just now;
/// `cached=true` means it was served from the cache (fresh or stale). A
/// stale answer always carries a `warning` explaining why it was not
/// refreshed.
#[derive(Debug, Clone)]
pub struct CacheLookup<T> {
    pub payload: T,
    pub cached: bool,
    pub cached_at: DateTime<Utc>,
    pub warning: Option<String>,
}

/// TTL cache for expensive per-connection enumeration calls, keyed by
/// resource key. Holds the owning supervisor's state watch so it can skip
/// refreshes while the connection is down.
pub struct DiscoveryCache<T> {
    connection_id: ConnectionId,
    state_rx: watch::Receiver<ConnectionState>,
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
}

impl<T: Clone> DiscoveryCache<T> {
    /// Build a cache bound to one connection. `state_rx` comes from
    /// [`crate::ConnectionSupervisor::state_watch`].
    pub fn new(connection_id: ConnectionId, state_rx: watch::Receiver<ConnectionState>) -> Self {
        Self {
            connection_id,
            state_rx,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Look up `resource_key`, refreshing through `refresh_fn` only when
    /// the cached entry is missing or older than `ttl` and the connection
    /// is up.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        resource_key: &str,
        ttl: Duration,
        refresh_fn: F,
    ) -> Result<CacheLookup<T>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(resource_key) {
                if entry.is_fresh() {
                    return Ok(CacheLookup {
                        payload: entry.payload.clone(),
                        cached: true,
                        cached_at: entry.cached_at,
                        warning: None,
                    });
                }
            }
        }

        let connected = self.state_rx.borrow().is_connected();
        if !connected {
            // Known-dead connection: serve whatever we have, never call out.
            let entries = self.entries.read().await;
            return match entries.get(resource_key) {
                Some(entry) => {
                    tracing::warn!(
                        "connection '{}' is down; serving stale '{}' cached at {}",
                        self.connection_id,
                        resource_key,
                        entry.cached_at
                    );
                    Ok(CacheLookup {
                        payload: entry.payload.clone(),
                        cached: true,
                        cached_at: entry.cached_at,
                        warning: Some(format!(
                            "connection '{}' is down; data cached at {}",
                            self.connection_id, entry.cached_at
                        )),
                    })
                }
                None => Err(CacheError::NoData {
                    connection_id: self.connection_id.clone(),
                    resource_key: resource_key.to_string(),
                }),
            };
        }

        match refresh_fn().await {
            Ok(payload) => {
                let cached_at = Utc::now();
                self.entries.write().await.insert(
                    resource_key.to_string(),
                    CacheEntry {
                        payload: payload.clone(),
                        cached_at,
                        stored: Instant::now(),
                        ttl,
                    },
                );
                Ok(CacheLookup {
                    payload,
                    cached: false,
                    cached_at,
                    warning: None,
                })
            }
            Err(err) => {
                let entries = self.entries.read().await;
                match entries.get(resource_key) {
                    Some(entry) => {
                        tracing::warn!(
                            "refresh of '{}' on '{}' failed ({}); serving stale data",
                            resource_key,
                            self.connection_id,
                            err
                        );
                        Ok(CacheLookup {
                            payload: entry.payload.clone(),
                            cached: true,
                            cached_at: entry.cached_at,
                            warning: Some(err.to_string()),
                        })
                    }
                    None => Err(CacheError::RefreshFailed {
                        resource_key: resource_key.to_string(),
                        source: err,
                    }),
                }
            }
        }
    }

    /// Drop one entry, forcing the next lookup to refresh. Returns whether
    /// an entry existed.
    pub async fn invalidate(&self, resource_key: &str) -> bool {
        self.entries.write().await.remove(resource_key).is_some()
    }

    /// Drop every entry. Used when the owning configuration changes.
    pub async fn purge(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn cache_with_state(state: ConnectionState) -> (DiscoveryCache<Vec<String>>, watch::Sender<ConnectionState>) {
        let (tx, rx) = watch::channel(state);
        (DiscoveryCache::new(ConnectionId::new("nvr-1"), rx), tx)
    }

    fn counting_refresh(
        counter: Arc<AtomicU32>,
        result: Result<Vec<String>, DriverError>,
    ) -> impl FnOnce() -> std::future::Ready<Result<Vec<String>, DriverError>> {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(result)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_window() {
        // ttl=60s: refresh at t=0 (miss), hit at t=30, refresh again at t=61.
        let (cache, _tx) = cache_with_state(ConnectionState::Connected);
        let calls = Arc::new(AtomicU32::new(0));
        let ttl = Duration::from_secs(60);

        let first = cache
            .get_or_refresh("cameras", ttl, counting_refresh(calls.clone(), Ok(vec!["cam-1".into()])))
            .await
            .unwrap();
        assert!(!first.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        let hit = cache
            .get_or_refresh("cameras", ttl, counting_refresh(calls.clone(), Ok(vec!["other".into()])))
            .await
            .unwrap();
        assert!(hit.cached);
        assert!(hit.warning.is_none());
        assert_eq!(hit.payload, vec!["cam-1".to_string()]);
        assert_eq!(hit.cached_at, first.cached_at);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let refreshed = cache
            .get_or_refresh("cameras", ttl, counting_refresh(calls.clone(), Ok(vec!["cam-2".into()])))
            .await
            .unwrap();
        assert!(!refreshed.cached);
        assert_eq!(refreshed.payload, vec!["cam-2".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_down_connection_serves_stale_without_calling_out() {
        let (cache, tx) = cache_with_state(ConnectionState::Connected);
        let calls = Arc::new(AtomicU32::new(0));
        let ttl = Duration::from_secs(60);

        cache
            .get_or_refresh("cameras", ttl, counting_refresh(calls.clone(), Ok(vec!["cam-1".into()])))
            .await
            .unwrap();

        tx.send_replace(ConnectionState::Reconnecting);
        tokio::time::advance(Duration::from_secs(120)).await;

        let stale = cache
            .get_or_refresh("cameras", ttl, counting_refresh(calls.clone(), Ok(vec!["fresh".into()])))
            .await
            .unwrap();
        assert!(stale.cached);
        assert_eq!(stale.payload, vec!["cam-1".to_string()]);
        assert!(stale.warning.unwrap().contains("down"));
        // The refresh was never attempted against the dead connection.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_down_connection_with_no_entry_is_explicit() {
        let (cache, _tx) = cache_with_state(ConnectionState::Disconnected);
        let calls = Arc::new(AtomicU32::new(0));

        let err = cache
            .get_or_refresh(
                "cameras",
                Duration::from_secs(60),
                counting_refresh(calls.clone(), Ok(vec![])),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NoData { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_falls_back_to_stale() {
        let (cache, _tx) = cache_with_state(ConnectionState::Connected);
        let calls = Arc::new(AtomicU32::new(0));
        let ttl = Duration::from_secs(60);

        cache
            .get_or_refresh("cameras", ttl, counting_refresh(calls.clone(), Ok(vec!["cam-1".into()])))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let fallback = cache
            .get_or_refresh(
                "cameras",
                ttl,
                counting_refresh(
                    calls.clone(),
                    Err(DriverError::new(ErrorKind::Timeout, "enumeration timed out")),
                ),
            )
            .await
            .unwrap();
        assert!(fallback.cached);
        assert_eq!(fallback.payload, vec!["cam-1".to_string()]);
        assert!(fallback.warning.unwrap().contains("enumeration timed out"));
    }

    #[tokio::test]
    async fn test_refresh_failure_with_no_entry_is_an_error() {
        let (cache, _tx) = cache_with_state(ConnectionState::Connected);
        let err = cache
            .get_or_refresh("cameras", Duration::from_secs(60), || {
                std::future::ready(Err::<Vec<String>, _>(DriverError::unreachable(
                    "controller not answering",
                )))
            })
            .await
            .unwrap_err();
        match err {
            CacheError::RefreshFailed { resource_key, source } => {
                assert_eq!(resource_key, "cameras");
                assert_eq!(source.kind, ErrorKind::Unreachable);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalidate_and_purge() {
        let (cache, _tx) = cache_with_state(ConnectionState::Connected);
        let ttl = Duration::from_secs(60);
        cache
            .get_or_refresh("cameras", ttl, || std::future::ready(Ok(vec!["a".to_string()])))
            .await
            .unwrap();
        cache
            .get_or_refresh("sensors", ttl, || std::future::ready(Ok(vec!["b".to_string()])))
            .await
            .unwrap();
        assert_eq!(cache.len().await, 2);

        assert!(cache.invalidate("cameras").await);
        assert!(!cache.invalidate("cameras").await);

        let refetched = cache
            .get_or_refresh("cameras", ttl, || std::future::ready(Ok(vec!["a2".to_string()])))
            .await
            .unwrap();
        assert!(!refetched.cached);

        cache.purge().await;
        assert!(cache.is_empty().await);
    }
}
