//! One delivery task per enabled endpoint
//!
//! The engine hands each record to every worker through a bounded queue.
//! A slow or dead endpoint only fills its own queue; once full, new records
//! for that endpoint are dropped and counted while the others keep flowing.

use bytes::Bytes;
use marlink_metadata::Endpoint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::log_ring::LogRing;
use crate::metrics::EndpointMetrics;
use crate::sender::{read_state, EndpointConnectionState, EndpointSender, SharedConnectionState};

/// Records buffered per endpoint before the newest ones are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub struct EndpointWorker {
    endpoint: Endpoint,
    tx: mpsc::Sender<Bytes>,
    state: SharedConnectionState,
    metrics: EndpointMetrics,
    log: Arc<LogRing>,
    /// Set while the queue is full so the overflow is logged once per episode
    overflowing: AtomicBool,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl EndpointWorker {
    /// Spawn the delivery task. It stops when `parent` (or the worker's own
    /// token) is cancelled; an in-flight send is abandoned at that point.
    pub fn spawn(
        sender: EndpointSender,
        capacity: usize,
        metrics: EndpointMetrics,
        log: Arc<LogRing>,
        parent: &CancellationToken,
    ) -> Self {
        let endpoint = sender.endpoint().clone();
        let state = sender.state_handle();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = parent.child_token();
        let handle = tokio::spawn(run(sender, rx, cancel.clone()));

        Self {
            endpoint,
            tx,
            state,
            metrics,
            log,
            overflowing: AtomicBool::new(false),
            cancel,
            handle,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> EndpointConnectionState {
        read_state(&self.state)
    }

    pub fn state_handle(&self) -> SharedConnectionState {
        Arc::clone(&self.state)
    }

    /// Queue `data` for delivery without waiting. Returns false if it was dropped.
    pub fn dispatch(&self, data: Bytes) -> bool {
        match self.tx.try_send(data) {
            Ok(()) => {
                if self.overflowing.swap(false, Ordering::Relaxed) {
                    debug!(endpoint = %self.endpoint.id, "Endpoint queue drained");
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.inc_queue_dropped();
                if !self.overflowing.swap(true, Ordering::Relaxed) {
                    self.log.warn(format!(
                        "Queue full for {}, dropping records until it drains",
                        self.endpoint
                    ));
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Cancel the task and wait for it to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            debug!(endpoint = %self.endpoint.id, error = %e, "Endpoint worker join failed");
        }
    }
}

async fn run(mut sender: EndpointSender, mut rx: mpsc::Receiver<Bytes>, cancel: CancellationToken) {
    loop {
        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(data) => data,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            // Failures are logged and recorded by the sender; the record is dropped
            _ = sender.send(&data) => {}
        }
    }
    debug!(endpoint = %sender.endpoint().id, "Endpoint worker stopped");
}
