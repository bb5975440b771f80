//! Blocking-thread adapter
//!
//! Local capture SDKs make blocking native calls that cannot run on a
//! cooperative loop. This adapter runs such a source on a dedicated OS
//! thread and marshals its events back through a bounded channel, so the
//! supervisor sees the same session contract as any async driver.
//!
//! `disconnect()` raises a stop flag and closes the channel; the pump
//! thread notices after its current read and winds down on its own. A
//! native call that never returns leaves the thread parked until process
//! exit, which is the same abandonment the registry applies to any hung
//! teardown.

use argus_link::{
    ConnectionDriver, DriverCapabilities, DriverError, DriverEvent, DriverSession,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Depth of the thread-to-task event channel. A full buffer applies
/// backpressure to the capture thread rather than growing without bound.
const EVENT_CHANNEL_DEPTH: usize = 64;

/// A synchronous event source run on its own thread.
///
/// All three methods may block. `read_event` returns `Ok(None)` when the
/// source ends cleanly and `Err` when it breaks; either way the session's
/// event stream ends and the supervisor handles the reconnect.
pub trait BlockingSource: Send + 'static {
    fn open(&mut self) -> Result<(), DriverError>;
    fn read_event(&mut self) -> Result<Option<DriverEvent>, DriverError>;
    fn close(&mut self);
}

/// Driver adapter wrapping a [`BlockingSource`] factory.
///
/// The factory runs once per connect, so every reconnect gets a fresh
/// source instance.
pub struct BlockingSourceDriver<S: BlockingSource> {
    label: String,
    capabilities: DriverCapabilities,
    factory: Box<dyn Fn() -> S + Send + Sync>,
}

impl<S: BlockingSource> BlockingSourceDriver<S> {
    pub fn new(label: impl Into<String>, factory: impl Fn() -> S + Send + Sync + 'static) -> Self {
        Self {
            label: label.into(),
            capabilities: DriverCapabilities::default(),
            factory: Box::new(factory),
        }
    }

    pub fn with_capabilities(mut self, capabilities: DriverCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[async_trait]
impl<S: BlockingSource> ConnectionDriver for BlockingSourceDriver<S> {
    fn name(&self) -> &str {
        &self.label
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    async fn connect(&self) -> Result<Box<dyn DriverSession>, DriverError> {
        let mut source = (self.factory)();

        // open() may block on native calls; keep it off the cooperative loop.
        let mut source = tokio::task::spawn_blocking(move || source.open().map(|()| source))
            .await
            .map_err(|e| DriverError::unknown(format!("source open task failed: {}", e)))??;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let label = self.label.clone();

        std::thread::Builder::new()
            .name(format!("{}-pump", self.label))
            .spawn(move || {
                loop {
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match source.read_event() {
                        Ok(Some(event)) => {
                            // blocking_send fails only when the session is
                            // gone; stop pumping then.
                            if tx.blocking_send(Ok(event)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("blocking source '{}' ended cleanly", label);
                            break;
                        }
                        Err(e) => {
                            let _ = tx.blocking_send(Err(e));
                            break;
                        }
                    }
                }
                source.close();
            })
            .map_err(|e| DriverError::unknown(format!("failed to spawn pump thread: {}", e)))?;

        Ok(Box::new(BlockingSession { rx, stop }))
    }
}

struct BlockingSession {
    rx: mpsc::Receiver<Result<DriverEvent, DriverError>>,
    stop: Arc<AtomicBool>,
}

#[async_trait]
impl DriverSession for BlockingSession {
    async fn next_event(&mut self) -> Option<Result<DriverEvent, DriverError>> {
        // Returns None once the pump thread exits and drops its sender.
        self.rx.recv().await
    }

    async fn disconnect(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.rx.close();
    }
}
