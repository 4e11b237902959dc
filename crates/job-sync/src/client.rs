//! Public facade: track jobs, cancel them, observe connection health.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cancel::{CancelAck, CancelCoordinator, SnapshotSink};
use crate::config::SyncConfig;
use crate::connection::{Connection, ConnectionParams};
use crate::control::{ControlPlane, HttpControlPlane};
use crate::error::{SyncError, SyncResult};
use crate::reconnect::ConnectionState;
use crate::registry::{Detached, JobCallbacks, Registry, TrackerHandle};
use crate::timers::TimerLedger;
use crate::transport::{
    PollingTransport, SseTransport, Transport, TransportKind, WebSocketTransport,
};
use crate::types::{JobId, JobKind, JobSnapshot, NotebookId, StreamTarget};

const EVENT_CAPACITY: usize = 64;

/// Connection-level notifications, e.g. for a "reconnecting" banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ConnectionState {
        target: StreamTarget,
        state: ConnectionState,
    },
    /// A multiplexed stream reported a change it could not attribute; every
    /// job on `target` is being re-fetched.
    RefreshAll { target: StreamTarget },
}

pub struct SyncClientBuilder {
    config: SyncConfig,
    control: Option<Arc<dyn ControlPlane>>,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl SyncClientBuilder {
    pub fn control_plane(mut self, control: Arc<dyn ControlPlane>) -> Self {
        self.control = Some(control);
        self
    }

    /// Replaces the transport registered for `transport.kind()`.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    pub fn build(self) -> SyncResult<SyncClient> {
        let SyncClientBuilder {
            config,
            control,
            mut transports,
        } = self;
        config.validate()?;

        let control: Arc<dyn ControlPlane> = match control {
            Some(control) => control,
            None => Arc::new(HttpControlPlane::new(&config)?),
        };
        if !transports.contains_key(&TransportKind::WebSocket) {
            transports.insert(
                TransportKind::WebSocket,
                Arc::new(WebSocketTransport::new(&config)?),
            );
        }
        if !transports.contains_key(&TransportKind::Sse) {
            transports.insert(TransportKind::Sse, Arc::new(SseTransport::new(&config)?));
        }
        if !transports.contains_key(&TransportKind::Polling) {
            transports.insert(
                TransportKind::Polling,
                Arc::new(PollingTransport::new(control.clone(), config.poll_interval())),
            );
        }

        let registry = Arc::new(Registry::new());
        let timers = TimerLedger::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let sink: Weak<dyn SnapshotSink> = weak.clone();
            Shared {
                cancel: CancelCoordinator::new(
                    control.clone(),
                    registry.clone(),
                    sink,
                    timers.clone(),
                    config.cancel_grace(),
                ),
                config,
                registry,
                control,
                transports,
                connections: Mutex::new(HashMap::new()),
                events,
                timers,
                closed: AtomicBool::new(false),
            }
        });
        Ok(SyncClient { shared })
    }
}

/// Keeps subscribers in step with server-side jobs.
///
/// Cheap to clone. Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct SyncClient {
    shared: Arc<Shared>,
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: SyncConfig) -> SyncClientBuilder {
        SyncClientBuilder {
            config,
            control: None,
            transports: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Starts delivering updates for `job_id`. The returned subscription
    /// keeps the tracker alive; drop it or call `unsubscribe` to stop.
    pub fn track(
        &self,
        job_id: impl Into<JobId>,
        kind: JobKind,
        notebook_id: impl Into<NotebookId>,
        callbacks: JobCallbacks,
    ) -> SyncResult<Subscription> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        let job_id = job_id.into();
        let notebook_id = notebook_id.into();
        let target = self.shared.config.target_for(&job_id, kind, &notebook_id);

        let handle = self.shared.registry.register(
            job_id.clone(),
            kind,
            &notebook_id,
            target.clone(),
            callbacks,
        );
        let joined_live_stream = self.shared.attach(&target, &job_id, kind);
        if joined_live_stream {
            self.shared.catch_up(job_id.clone(), kind);
        }
        info!(
            target = "job_sync.client",
            %job_id,
            %kind,
            stream = %target,
            %handle,
            "tracking job"
        );

        Ok(Subscription {
            handle,
            job_id,
            shared: Arc::downgrade(&self.shared),
            active: true,
        })
    }

    /// Requests server-side cancellation. Local state only changes once the
    /// stream (or a 404, or the grace timeout) settles the job.
    pub async fn cancel(&self, job_id: &JobId) -> SyncResult<CancelAck> {
        self.shared.cancel.cancel(job_id).await
    }

    pub async fn submit(
        &self,
        kind: JobKind,
        notebook_id: &NotebookId,
        params: Map<String, Value>,
    ) -> SyncResult<JobId> {
        Ok(self.shared.control.submit(kind, notebook_id, params).await?)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn connection_state(&self, target: &StreamTarget) -> Option<ConnectionState> {
        self.shared
            .connections
            .lock()
            .get(target)
            .map(|connection| connection.state())
    }

    pub fn active_connections(&self) -> Vec<StreamTarget> {
        self.shared.connections.lock().keys().cloned().collect()
    }

    pub fn tracked_jobs(&self) -> Vec<JobId> {
        self.shared.registry.tracked_jobs()
    }

    pub fn last_snapshot(&self, job_id: &JobId) -> Option<JobSnapshot> {
        self.shared.registry.last_snapshot(job_id)
    }

    /// Timers currently armed across every connection and cancel request.
    pub fn pending_timers(&self) -> usize {
        self.shared.timers.pending()
    }

    /// Unsubscribes everything and waits for every connection to tear down.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = self.shared.registry.drain();
        debug!(target = "job_sync.client", trackers = drained.len(), "closing sync client");
        self.shared.cancel.drain().await;

        let connections: Vec<Arc<Connection>> = self
            .shared
            .connections
            .lock()
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in connections {
            connection.shutdown().await;
        }
    }
}

/// Unsubscribe capability for one `track` call.
#[must_use = "dropping a Subscription stops its callbacks"]
pub struct Subscription {
    handle: TrackerHandle,
    job_id: JobId,
    shared: Weak<Shared>,
    active: bool,
}

impl Subscription {
    pub fn handle(&self) -> TrackerHandle {
        self.handle
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// No callback for this subscription runs after this returns. Never
    /// cancels the job on the server.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Some(detached) = shared.registry.unregister(self.handle) {
            shared.release(vec![detached]);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .field("job_id", &self.job_id)
            .field("active", &self.active)
            .finish()
    }
}

struct Shared {
    config: SyncConfig,
    registry: Arc<Registry>,
    control: Arc<dyn ControlPlane>,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    connections: Mutex<HashMap<StreamTarget, Arc<Connection>>>,
    cancel: CancelCoordinator,
    events: broadcast::Sender<SyncEvent>,
    timers: TimerLedger,
    closed: AtomicBool,
}

impl Shared {
    /// Attaches a job to the connection for `target`, spawning it if needed.
    /// Returns `true` when the job joined a stream that was already live.
    fn attach(self: &Arc<Self>, target: &StreamTarget, job_id: &JobId, kind: JobKind) -> bool {
        let mut connections = self.connections.lock();
        let reusable = connections
            .get(target)
            .filter(|connection| connection.state() != ConnectionState::Closed)
            .cloned();
        let (connection, joined_live) = match reusable {
            Some(connection) => {
                let live = target.is_multiplexed()
                    && connection.state() == ConnectionState::Connected
                    && connection.has_jobs();
                (connection, live)
            }
            None => {
                let connection = Arc::new(Connection::spawn(self.connection_params(target)));
                if let Some(stale) = connections.insert(target.clone(), connection.clone()) {
                    stale.stop();
                }
                (connection, false)
            }
        };
        connection.attach(job_id.clone(), kind);
        joined_live
    }

    fn connection_params(self: &Arc<Self>, target: &StreamTarget) -> ConnectionParams {
        let streaming_kind = match target {
            StreamTarget::JobSocket { .. } => TransportKind::WebSocket,
            StreamTarget::JobStream { .. } | StreamTarget::NotebookFiles { .. } => {
                TransportKind::Sse
            }
        };
        let streaming = if self.config.streaming_enabled {
            self.transports.get(&streaming_kind).cloned()
        } else {
            None
        };
        let polling = self
            .transports
            .get(&TransportKind::Polling)
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(PollingTransport::new(self.control.clone(), self.config.poll_interval()))
            });
        let weak: Weak<Shared> = Arc::downgrade(self);
        let sink: Weak<dyn SnapshotSink> = weak;

        ConnectionParams {
            target: target.clone(),
            streaming,
            polling,
            control: self.control.clone(),
            sink,
            events: self.events.clone(),
            timers: self.timers.clone(),
            backoff: self.config.backoff(),
            heartbeat_timeout: self.config.heartbeat_timeout(),
            ping_interval: self.config.heartbeat_interval(),
            poll_interval: self.config.poll_interval(),
        }
    }

    /// A multiplexed stream does not replay history, so a job joining it late
    /// gets one snapshot fetched directly.
    fn catch_up(self: &Arc<Self>, job_id: JobId, kind: JobKind) {
        let control = self.control.clone();
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            match control.fetch_snapshot(kind, &job_id).await {
                Ok(snapshot) => {
                    if let Some(shared) = shared.upgrade() {
                        shared.dispatch(snapshot);
                    }
                }
                Err(err) => {
                    warn!(
                        target = "job_sync.client",
                        %job_id,
                        error = %err,
                        "catch-up fetch failed"
                    );
                }
            }
        });
    }

    /// Detaches released jobs and closes connections left without trackers.
    fn release(&self, detached: Vec<Detached>) {
        if detached.is_empty() {
            return;
        }
        let mut connections = self.connections.lock();
        for entry in detached {
            self.cancel.forget(&entry.job_id, entry.handle);
            // A concurrent `track` may have registered the job again; its
            // attach runs under this lock and must not be undone.
            if !entry.job_released || self.registry.kind_of(&entry.job_id).is_some() {
                continue;
            }
            let Some(connection) = connections.get(&entry.target).cloned() else {
                continue;
            };
            connection.detach(&entry.job_id);
            if self.registry.jobs_for(&entry.target).is_empty() {
                connections.remove(&entry.target);
                connection.stop();
                debug!(
                    target = "job_sync.client",
                    stream = %entry.target,
                    "last tracker detached; closing connection"
                );
            }
        }
    }
}

impl SnapshotSink for Shared {
    fn dispatch(&self, snapshot: JobSnapshot) {
        let detached = self.registry.dispatch(&snapshot);
        self.release(detached);
    }

    fn dispatch_to(&self, handles: &[TrackerHandle], snapshot: JobSnapshot) {
        let detached = self.registry.dispatch_to(handles, &snapshot);
        self.release(detached);
    }
}
