//! Forwarding engine: read, filter, fan out
//!
//! One engine per protocol instance. `start` spawns the main loop as its own
//! task together with one [`EndpointWorker`] per enabled endpoint; the control
//! plane only talks to the engine through `start`, `stop`, `restart`, `status`
//! and `logs`, all of which are safe to call while the loop runs.
//!
//! State machine: `Stopped -> Starting -> Running -> Stopping -> Stopped`.

use marlink_metadata::{Endpoint, EndpointRegistry, FilterPolicy, InstanceConfig, SourceConfig};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, SourceError};
use crate::filter::RecordFilter;
use crate::log_ring::{LogEntry, LogRing, DEFAULT_LOG_CAPACITY};
use crate::metrics::EngineMetrics;
use crate::record::Record;
use crate::sender::{read_state, EndpointConnectionState, EndpointSender, SharedConnectionState};
use crate::traits::{RecordSource, SourceFactory};
use crate::worker::{EndpointWorker, DEFAULT_QUEUE_CAPACITY};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// JSON payload returned to the control plane
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub instance: String,
    pub running: bool,
    pub state: EngineState,
    pub source_config: SourceConfig,
    pub filter: FilterPolicy,
    pub endpoints: Vec<Endpoint>,
    pub endpoint_status: BTreeMap<String, EndpointConnectionState>,
}

/// What the running loop currently works with, published for status reads
struct Snapshot {
    source: SourceConfig,
    filter: FilterPolicy,
    endpoints: Vec<Endpoint>,
    states: Vec<(String, SharedConnectionState)>,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    stop_grace: Duration,
}

pub struct ForwardingEngine {
    name: String,
    registry: Arc<EndpointRegistry>,
    factory: Arc<dyn SourceFactory>,
    log: Arc<LogRing>,
    metrics: EngineMetrics,
    queue_capacity: usize,
    state: Arc<RwLock<EngineState>>,
    snapshot: Arc<RwLock<Option<Snapshot>>>,
    /// Serializes start/stop/restart
    run: Mutex<Option<RunHandle>>,
}

impl ForwardingEngine {
    pub fn new(registry: Arc<EndpointRegistry>, factory: Arc<dyn SourceFactory>) -> Self {
        let name = registry.config().name;
        Self {
            log: Arc::new(LogRing::new(name.clone(), DEFAULT_LOG_CAPACITY)),
            metrics: EngineMetrics::new(name.clone()),
            name,
            registry,
            factory,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            state: Arc::new(RwLock::new(EngineState::Stopped)),
            snapshot: Arc::new(RwLock::new(None)),
            run: Mutex::new(None),
        }
    }

    /// Override the per-endpoint queue depth
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn state(&self) -> EngineState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Launch the forwarding loop and return immediately
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        self.set_state(EngineState::Starting);

        let config = self.registry.config();
        let cancel = CancellationToken::new();
        let stop_grace = config.backoff.stop_grace();

        let mut session = Session {
            name: self.name.clone(),
            registry: Arc::clone(&self.registry),
            factory: Arc::clone(&self.factory),
            log: Arc::clone(&self.log),
            metrics: self.metrics.clone(),
            queue_capacity: self.queue_capacity,
            snapshot: Arc::clone(&self.snapshot),
            filter: RecordFilter::new(&config.filter, config.format),
            config,
            workers: Vec::new(),
            cancel: cancel.clone(),
        };
        session.workers = session
            .config
            .enabled_endpoints()
            .into_iter()
            .map(|endpoint| session.spawn_worker(endpoint))
            .collect();
        session.publish();
        session.log_loaded();

        let endpoint_count = session.workers.len();
        let task = tokio::spawn(session.run());
        *run = Some(RunHandle {
            cancel,
            task,
            stop_grace,
        });

        self.set_state(EngineState::Running);
        self.log.info(format!(
            "{} service started with {} endpoint(s)",
            self.name, endpoint_count
        ));
        Ok(())
    }

    /// Signal the loop and wait up to the stop grace period for it to exit
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut run = self.run.lock().await;
        let Some(mut handle) = run.take() else {
            return Err(EngineError::NotRunning);
        };
        self.set_state(EngineState::Stopping);

        handle.cancel.cancel();
        match timeout(handle.stop_grace, &mut handle.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.log.error(format!("{} forwarding loop failed: {}", self.name, e));
            }
            Err(_) => {
                self.log.warn(format!(
                    "{} forwarding loop did not exit within {:?}, aborting",
                    self.name, handle.stop_grace
                ));
                handle.task.abort();
            }
        }

        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = None;
        self.set_state(EngineState::Stopped);
        self.log.info(format!("{} service stopped", self.name));
        Ok(())
    }

    /// Stop (if running), wait the restart delay, start again
    pub async fn restart(&self) -> Result<(), EngineError> {
        match self.stop().await {
            Ok(()) | Err(EngineError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        sleep(self.registry.config().backoff.restart_delay()).await;
        self.start().await
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.state();
        let snapshot = self.snapshot.read().unwrap_or_else(|p| p.into_inner());

        match snapshot.as_ref() {
            Some(snapshot) => EngineStatus {
                instance: self.name.clone(),
                running: state == EngineState::Running,
                state,
                source_config: snapshot.source.clone(),
                filter: snapshot.filter.clone(),
                endpoints: snapshot.endpoints.clone(),
                endpoint_status: snapshot
                    .states
                    .iter()
                    .map(|(id, handle)| (id.clone(), read_state(handle)))
                    .collect(),
            },
            None => {
                let config = self.registry.config();
                EngineStatus {
                    instance: self.name.clone(),
                    running: state == EngineState::Running,
                    state,
                    source_config: config.source,
                    filter: config.filter,
                    endpoints: config.endpoints,
                    endpoint_status: BTreeMap::new(),
                }
            }
        }
    }

    /// Last `count` log entries, oldest first
    pub fn logs(&self, count: usize) -> Vec<LogEntry> {
        self.log.recent(count)
    }

    fn set_state(&self, state: EngineState) {
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = state;
        debug!(instance = %self.name, state = ?state, "Engine state changed");
    }
}

/// The running loop and everything it owns
struct Session {
    name: String,
    registry: Arc<EndpointRegistry>,
    factory: Arc<dyn SourceFactory>,
    log: Arc<LogRing>,
    metrics: EngineMetrics,
    queue_capacity: usize,
    snapshot: Arc<RwLock<Option<Snapshot>>>,
    config: InstanceConfig,
    filter: RecordFilter,
    workers: Vec<EndpointWorker>,
    cancel: CancellationToken,
}

enum SessionEnd {
    Cancelled,
    Lost,
}

impl Session {
    async fn run(mut self) {
        let mut next_reload = self.reload_deadline();

        while !self.cancel.is_cancelled() {
            self.maybe_reload(&mut next_reload).await;

            let mut source = self.factory.create(&self.config.source);
            let described = source.describe();

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                opened = source.open() => opened,
            };
            if let Err(e) = opened {
                let delay = self.config.backoff.source_retry();
                self.log.error(format!("Failed to connect to {}: {}", described, e));
                self.log.info(format!("Waiting for {} (retry in {:?})", described, delay));
                if self.pause(delay).await {
                    break;
                }
                continue;
            }

            self.log.info(format!("Connected to {}", described));
            self.metrics.set_source_connected(true);

            let end = self
                .forward(source.as_mut(), &described, &mut next_reload)
                .await;

            source.close().await;
            self.metrics.set_source_connected(false);

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Lost => {
                    if self.pause(self.config.backoff.session_retry()).await {
                        break;
                    }
                }
            }
        }

        for worker in self.workers.drain(..) {
            worker.stop().await;
        }
        self.log.info(format!("{} forwarding loop ended", self.name));
    }

    async fn forward(
        &mut self,
        source: &mut dyn RecordSource,
        described: &str,
        next_reload: &mut Option<Instant>,
    ) -> SessionEnd {
        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                read = source.read_record() => read,
            };

            match read {
                Ok(Some(record)) => self.handle(record),
                Ok(None) => {}
                Err(SourceError::Decode(reason)) => {
                    self.metrics.inc_decode_error();
                    debug!(instance = %self.name, reason = %reason, "Dropping undecodable record");
                }
                Err(SourceError::Closed) => {
                    self.log.warn(format!("{} connection lost", described));
                    return SessionEnd::Lost;
                }
                Err(e) => {
                    self.log.error(format!("Error reading from {}: {}", described, e));
                    return SessionEnd::Lost;
                }
            }

            self.maybe_reload(next_reload).await;
        }
    }

    fn handle(&self, record: Record) {
        self.metrics.inc_read();
        if !self.filter.should_forward(&record) {
            self.metrics.inc_filtered();
            return;
        }

        let wire = record.to_wire(self.config.format.terminator());
        for worker in &self.workers {
            worker.dispatch(wire.clone());
        }
    }

    /// Sleep for `delay` unless cancelled first. Returns true when cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = sleep(delay) => false,
        }
    }

    fn reload_deadline(&self) -> Option<Instant> {
        match self.config.reload_interval_secs {
            0 => None,
            secs => Some(Instant::now() + Duration::from_secs(secs)),
        }
    }

    async fn maybe_reload(&mut self, next_reload: &mut Option<Instant>) {
        match *next_reload {
            Some(deadline) if Instant::now() >= deadline => {}
            _ => return,
        }
        self.reload().await;
        *next_reload = self.reload_deadline();
    }

    /// Re-read filter, endpoints and send policy. Workers of unchanged
    /// endpoints are kept with their state; the source itself only changes on
    /// restart. An unreadable file leaves the running configuration in place.
    async fn reload(&mut self) {
        let mut fresh = match InstanceConfig::load(self.registry.path()) {
            Ok(config) => config,
            Err(e) => {
                self.log.warn(format!(
                    "Failed to reload configuration, keeping current settings: {}",
                    e
                ));
                return;
            }
        };
        fresh.source = self.config.source.clone();

        let policy_changed =
            fresh.retry != self.config.retry || fresh.delivery != self.config.delivery;
        let changed = policy_changed
            || fresh.filter != self.config.filter
            || fresh.endpoints != self.config.endpoints;
        if !changed {
            debug!(instance = %self.name, "Configuration unchanged on reload");
            self.config = fresh;
            return;
        }

        self.filter = RecordFilter::new(&fresh.filter, fresh.format);
        self.config = fresh;

        // Senders carry the retry and delivery policy, so a policy change
        // replaces every worker
        let mut current = std::mem::take(&mut self.workers);
        let mut workers = Vec::new();
        for endpoint in self.config.enabled_endpoints() {
            let kept = if policy_changed {
                None
            } else {
                current.iter().position(|w| w.endpoint().same_target(&endpoint))
            };
            match kept {
                Some(index) => workers.push(current.swap_remove(index)),
                None => workers.push(self.spawn_worker(endpoint)),
            }
        }
        for removed in current {
            debug!(instance = %self.name, endpoint = %removed.endpoint().id, "Stopping replaced endpoint worker");
            removed.stop().await;
        }
        self.workers = workers;

        self.publish();
        self.log_loaded();
    }

    fn spawn_worker(&self, endpoint: Endpoint) -> EndpointWorker {
        let metrics = self.metrics.for_endpoint(&endpoint.id);
        let sender = EndpointSender::new(
            endpoint,
            self.config.retry.clone(),
            self.config.delivery,
            Arc::clone(&self.log),
            metrics.clone(),
        );
        EndpointWorker::spawn(
            sender,
            self.queue_capacity,
            metrics,
            Arc::clone(&self.log),
            &self.cancel,
        )
    }

    fn publish(&self) {
        let snapshot = Snapshot {
            source: self.config.source.clone(),
            filter: self.config.filter.clone(),
            endpoints: self.config.endpoints.clone(),
            states: self
                .workers
                .iter()
                .map(|w| (w.endpoint().id.clone(), w.state_handle()))
                .collect(),
        };
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = Some(snapshot);
    }

    fn log_loaded(&self) {
        self.log.info(format!(
            "Configuration loaded: Filter={}, Endpoints={}",
            self.config.filter,
            self.workers.len()
        ));
    }
}
