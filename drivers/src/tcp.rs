//! Native-async NVR controller adapter
//!
//! Speaks a deliberately small line protocol: an optional `AUTH <token>`
//! handshake answered with `OK` or `ERR ...`, then one JSON event per line.
//! Lines carrying `camera_id` and `online` become sub-resource signals;
//! everything else passes through opaque. Anything richer (WebSocket
//! framing, protobuf payloads) belongs in a different driver behind the
//! same contract.

use argus_link::{ConnectionDriver, DriverCapabilities, DriverError, DriverEvent, DriverSession};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Default event port for NVR-style controllers.
pub const NVR_DEFAULT_PORT: u16 = 7441;

/// Connection settings for one controller.
#[derive(Debug, Clone)]
pub struct NvrTcpConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token sent in the handshake. `None` skips the handshake
    /// entirely (local unauthenticated controllers).
    pub auth_token: Option<String>,
}

impl NvrTcpConfig {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port: port.unwrap_or(NVR_DEFAULT_PORT),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Async TCP driver for NVR-style controllers.
///
/// Holds configuration only; the supervisor calls `connect()` again on
/// every reconnect.
pub struct NvrTcpDriver {
    config: NvrTcpConfig,
}

impl NvrTcpDriver {
    pub fn new(config: NvrTcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionDriver for NvrTcpDriver {
    fn name(&self) -> &str {
        "nvr-tcp"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            reports_resource_status: true,
        }
    }

    async fn connect(&self) -> Result<Box<dyn DriverSession>, DriverError> {
        let addr = self.config.addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| DriverError::from_io(&format!("connect to {}", addr), &e))?;

        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut writer = write_half;

        if let Some(token) = &self.config.auth_token {
            writer
                .write_all(format!("AUTH {}\n", token).as_bytes())
                .await
                .map_err(|e| DriverError::from_io("handshake write", &e))?;

            match lines.next_line().await {
                Ok(Some(line)) if line.trim() == "OK" => {
                    tracing::debug!("controller at {} accepted token", addr);
                }
                Ok(Some(line)) => {
                    return Err(DriverError::auth(format!(
                        "controller at {} rejected token: {}",
                        addr,
                        line.trim()
                    )));
                }
                Ok(None) => {
                    return Err(DriverError::unreachable(format!(
                        "controller at {} closed the connection during handshake",
                        addr
                    )));
                }
                Err(e) => return Err(DriverError::from_io("handshake read", &e)),
            }
        }

        Ok(Box::new(NvrTcpSession {
            lines,
            writer: Some(writer),
        }))
    }
}

struct NvrTcpSession {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
}

#[async_trait]
impl DriverSession for NvrTcpSession {
    async fn next_event(&mut self) -> Option<Result<DriverEvent, DriverError>> {
        if self.writer.is_none() {
            return None;
        }
        match self.lines.next_line().await {
            Ok(Some(line)) => Some(Ok(parse_event_line(&line))),
            Ok(None) => None,
            Err(e) => Some(Err(DriverError::from_io("event read", &e))),
        }
    }

    async fn disconnect(&mut self) {
        // Idempotent: the second call finds the writer already gone, and a
        // failed shutdown on a dead socket is ignored.
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Map one protocol line to a driver event. Camera presence lines become
/// sub-resource signals; everything else stays opaque.
fn parse_event_line(line: &str) -> DriverEvent {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
        if let (Some(camera_id), Some(online)) = (
            value.get("camera_id").and_then(|v| v.as_str()),
            value.get("online").and_then(|v| v.as_bool()),
        ) {
            return DriverEvent::ResourceOnline {
                resource_id: camera_id.to_string(),
                is_online: online,
            };
        }
    }
    DriverEvent::Message(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_link::{
        BackoffPolicy, ConnectionId, ConnectionState, ConnectionSupervisor, ErrorKind,
        StatusBroadcaster, SupervisorConfig,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, NvrTcpConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, NvrTcpConfig::new("127.0.0.1", Some(port)))
    }

    #[test]
    fn test_parse_event_line() {
        assert_eq!(
            parse_event_line(r#"{"camera_id":"cam-3","online":false}"#),
            DriverEvent::ResourceOnline {
                resource_id: "cam-3".to_string(),
                is_online: false,
            }
        );
        assert_eq!(
            parse_event_line(r#"{"type":"motion","camera":"cam-3"}"#),
            DriverEvent::Message(r#"{"type":"motion","camera":"cam-3"}"#.to_string())
        );
        assert_eq!(
            parse_event_line("not json at all"),
            DriverEvent::Message("not json at all".to_string())
        );
    }

    #[tokio::test]
    async fn test_connect_and_stream_events() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"{\"camera_id\":\"cam-1\",\"online\":true}\n{\"type\":\"motion\"}\n")
                .await
                .unwrap();
            // Closing ends the event stream.
        });

        let driver = NvrTcpDriver::new(config);
        let mut session = driver.connect().await.unwrap();

        assert_eq!(
            session.next_event().await.unwrap().unwrap(),
            DriverEvent::ResourceOnline {
                resource_id: "cam-1".to_string(),
                is_online: true,
            }
        );
        assert_eq!(
            session.next_event().await.unwrap().unwrap(),
            DriverEvent::Message("{\"type\":\"motion\"}".to_string())
        );
        assert!(session.next_event().await.is_none());

        session.disconnect().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_handshake_accepted() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"AUTH sekrit\n");
            socket.write_all(b"OK\n{\"type\":\"ready\"}\n").await.unwrap();
        });

        let driver = NvrTcpDriver::new(config.with_auth_token("sekrit"));
        let mut session = driver.connect().await.unwrap();
        assert_eq!(
            session.next_event().await.unwrap().unwrap(),
            DriverEvent::Message("{\"type\":\"ready\"}".to_string())
        );
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_rejected_token_classifies_as_auth_error() {
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"ERR bad token\n").await.unwrap();
        });

        let driver = NvrTcpDriver::new(config.with_auth_token("wrong"));
        let err = driver.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthError);
        assert!(err.message.contains("bad token"));
        assert_eq!(driver.classify(&err), ErrorKind::AuthError);
    }

    #[tokio::test]
    async fn test_refused_connect_classifies_as_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let (listener, config) = listener().await;
        drop(listener);

        let driver = NvrTcpDriver::new(config);
        let err = driver.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn test_supervised_reconnect_end_to_end() {
        // The controller drops the first connection after one event; the
        // supervisor reconnects and keeps streaming on the second.
        let (listener, config) = listener().await;
        tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            first
                .write_all(b"{\"camera_id\":\"cam-1\",\"online\":true}\n")
                .await
                .unwrap();
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            second
                .write_all(b"{\"type\":\"recovered\"}\n")
                .await
                .unwrap();
            // Hold the second connection open.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let broadcaster = StatusBroadcaster::default();
        let supervisor = ConnectionSupervisor::new(
            ConnectionId::new("nvr-e2e"),
            Arc::new(NvrTcpDriver::new(config)),
            SupervisorConfig::default(),
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
            broadcaster.clone(),
        );
        let mut events = supervisor.subscribe_events();

        assert!(supervisor.start().await);
        assert_eq!(
            events.recv().await.unwrap(),
            DriverEvent::ResourceOnline {
                resource_id: "cam-1".to_string(),
                is_online: true,
            }
        );

        // First connection died; receiving from the second connection
        // proves the supervisor reconnected on its own.
        assert_eq!(
            events.recv().await.unwrap(),
            DriverEvent::Message("{\"type\":\"recovered\"}".to_string())
        );
        assert_eq!(
            supervisor.status().await.state,
            ConnectionState::Connected
        );

        supervisor.stop(Duration::from_secs(5)).await;
    }
}
