//! Delivery of records to one downstream endpoint
//!
//! Each `send` makes up to `retry.attempts` attempts, sleeping `retry.delay`
//! between failures. In `per_record` mode every attempt opens a fresh TCP
//! connection, writes the record and closes it. In `persistent` mode the
//! connection is kept and only re-established after a failure.
//!
//! Only the final failure of a call is logged at ERROR; intermediate attempts
//! go to `debug`.

use chrono::{DateTime, Utc};
use marlink_metadata::{DeliveryMode, Endpoint, RetryConfig};
use serde::Serialize;
use std::io;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::SendError;
use crate::log_ring::LogRing;
use crate::metrics::EndpointMetrics;

/// Runtime view of one endpoint, written only by its sender
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EndpointConnectionState {
    pub connected: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

pub type SharedConnectionState = Arc<RwLock<EndpointConnectionState>>;

pub struct EndpointSender {
    endpoint: Endpoint,
    retry: RetryConfig,
    mode: DeliveryMode,
    state: SharedConnectionState,
    log: Arc<LogRing>,
    metrics: EndpointMetrics,
    /// Open connection in persistent mode
    conn: Option<TcpStream>,
}

impl EndpointSender {
    pub fn new(
        endpoint: Endpoint,
        retry: RetryConfig,
        mode: DeliveryMode,
        log: Arc<LogRing>,
        metrics: EndpointMetrics,
    ) -> Self {
        Self {
            endpoint,
            retry,
            mode,
            state: Arc::new(RwLock::new(EndpointConnectionState::default())),
            log,
            metrics,
            conn: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Read handle for status reporting
    pub fn state_handle(&self) -> SharedConnectionState {
        Arc::clone(&self.state)
    }

    pub fn state(&self) -> EndpointConnectionState {
        read_state(&self.state)
    }

    /// Deliver `data`, retrying per the policy. Returns the number of
    /// attempts used on success.
    pub async fn send(&mut self, data: &[u8]) -> Result<u32, SendError> {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.attempt(data).await {
                Ok(()) => {
                    self.set_state(true, None);
                    self.metrics.record_sent();
                    if attempt > 0 {
                        self.log
                            .info(format!("Reconnected to {}", self.endpoint));
                    }
                    return Ok(attempt + 1);
                }
                Err(e) => {
                    last_error = e.to_string();
                    self.set_state(false, Some(last_error.clone()));
                    debug!(
                        endpoint = %self.endpoint.id,
                        attempt = attempt + 1,
                        error = %e,
                        "Send attempt failed"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry.delay()).await;
                    }
                }
            }
        }

        self.metrics.record_failed();
        self.log.error(format!(
            "Failed to send to {} after {} attempts: {}",
            self.endpoint.name, attempts, last_error
        ));
        Err(SendError::Exhausted {
            attempts,
            last_error,
        })
    }

    async fn attempt(&mut self, data: &[u8]) -> io::Result<()> {
        match self.mode {
            DeliveryMode::PerRecord => {
                let mut stream = self.connect().await?;
                stream.write_all(data).await?;
                // Peer may already have gone; the record is written either way
                let _ = stream.shutdown().await;
                Ok(())
            }
            DeliveryMode::Persistent => {
                let mut stream = match self.conn.take() {
                    Some(stream) => stream,
                    None => self.connect().await?,
                };
                stream.write_all(data).await?;
                self.conn = Some(stream);
                Ok(())
            }
        }
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = timeout(
            self.retry.connect_timeout(),
            TcpStream::connect((self.endpoint.ip.as_str(), self.endpoint.port)),
        )
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.retry.connect_timeout()),
            )
        })??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn set_state(&self, connected: bool, error: Option<String>) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        state.connected = connected;
        state.error = error;
        state.last_attempt = Some(Utc::now());
    }
}

pub fn read_state(state: &SharedConnectionState) -> EndpointConnectionState {
    state.read().unwrap_or_else(|p| p.into_inner()).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_ring::LogLevel;
    use crate::metrics::EngineMetrics;
    use std::time::{Duration, Instant};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            id: "ENDPOINT_1".to_string(),
            name: "Shore".to_string(),
            ip: "127.0.0.1".to_string(),
            port,
            enabled: true,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            attempts: 3,
            delay_ms: 50,
            connect_timeout_ms: 500,
        }
    }

    fn sender(port: u16, mode: DeliveryMode, retry: RetryConfig) -> (EndpointSender, Arc<LogRing>) {
        let log = Arc::new(LogRing::new("sender-test", 50));
        let metrics = EngineMetrics::new("sender-test").for_endpoint("ENDPOINT_1");
        (
            EndpointSender::new(endpoint(port), retry, mode, Arc::clone(&log), metrics),
            log,
        )
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn test_default_policy_is_three_attempts_two_seconds_apart() {
        let retry = RetryConfig::default();
        assert_eq!(retry.attempts, 3);
        assert_eq!(retry.delay(), Duration::from_secs(2));
        assert_eq!(retry.connect_timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_send_delivers_bytes_verbatim() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let (mut sender, log) = sender(port, DeliveryMode::PerRecord, fast_retry());
        let attempts = sender.send(b"MSG,3,1,1,A92F2D,1\n").await.unwrap();
        assert_eq!(attempts, 1);

        assert_eq!(server.await.unwrap(), b"MSG,3,1,1,A92F2D,1\n");
        let state = sender.state();
        assert!(state.connected);
        assert!(state.error.is_none());
        assert!(state.last_attempt.is_some());
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_exhausts_three_attempts() {
        let port = closed_port().await;
        let (mut sender, log) = sender(port, DeliveryMode::PerRecord, fast_retry());

        let started = Instant::now();
        let result = sender.send(b"record\n").await;
        let elapsed = started.elapsed();

        match result {
            Err(SendError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert!(!last_error.is_empty());
            }
            other => panic!("expected exhausted, got {:?}", other),
        }
        // Two sleeps between three attempts
        assert!(elapsed >= Duration::from_millis(100));

        let state = sender.state();
        assert!(!state.connected);
        assert!(state.error.is_some());

        let errors: Vec<_> = log
            .recent(50)
            .into_iter()
            .filter(|e| e.level == LogLevel::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_retry_success_logs_reconnected() {
        let port = closed_port().await;
        let retry = RetryConfig {
            attempts: 3,
            delay_ms: 300,
            connect_timeout_ms: 500,
        };
        let (mut sender, log) = sender(port, DeliveryMode::PerRecord, retry);

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let attempts = sender.send(b"late\n").await.unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(server.await.unwrap(), b"late\n");
        assert!(sender.state().connected);
        assert!(log
            .recent(10)
            .iter()
            .any(|e| e.level == LogLevel::Info && e.message.starts_with("Reconnected to Shore")));
    }

    #[tokio::test]
    async fn test_persistent_mode_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 64];
            while received.len() < 4 {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0);
                received.extend_from_slice(&chunk[..n]);
            }
            received
        });

        let (mut sender, _log) = sender(port, DeliveryMode::Persistent, fast_retry());
        assert_eq!(sender.send(b"a\n").await.unwrap(), 1);
        assert_eq!(sender.send(b"b\n").await.unwrap(), 1);

        assert_eq!(server.await.unwrap(), b"a\nb\n");
    }
}
