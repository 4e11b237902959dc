//! Connection supervisor: one task per stream target that opens the link,
//! watches its heartbeat, retries with backoff and finally degrades to
//! polling.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::SnapshotSink;
use crate::client::SyncEvent;
use crate::control::ControlPlane;
use crate::error::{SyncError, TransportError};
use crate::heartbeat::{Beat, HeartbeatMonitor};
use crate::reconnect::{BackoffConfig, ConnectionState, Decision, Failure, ReconnectPolicy};
use crate::timers::{TimerKind, TimerLedger};
use crate::transport::{ControlMessage, JobSet, Link, OpenRequest, RawEvent, Transport};
use crate::types::{JobId, JobKind, JobSnapshot, StreamTarget};

/// Everything a supervisor needs; assembled by the client per target.
pub struct ConnectionParams {
    pub target: StreamTarget,
    /// `None` starts the connection directly in polling mode.
    pub streaming: Option<Arc<dyn Transport>>,
    pub polling: Arc<dyn Transport>,
    pub control: Arc<dyn ControlPlane>,
    pub sink: Weak<dyn SnapshotSink>,
    pub events: broadcast::Sender<SyncEvent>,
    pub timers: TimerLedger,
    pub backoff: BackoffConfig,
    pub heartbeat_timeout: Duration,
    pub ping_interval: Duration,
    pub poll_interval: Duration,
}

/// Handle to a running supervisor. Dropping it stops the task.
pub struct Connection {
    target: StreamTarget,
    jobs: JobSet,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn spawn(params: ConnectionParams) -> Self {
        let jobs = JobSet::new();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shutdown = CancellationToken::new();
        let target = params.target.clone();

        let supervisor = Supervisor {
            request: OpenRequest {
                target: params.target.clone(),
                jobs: jobs.clone(),
                timers: params.timers.clone(),
            },
            policy: ReconnectPolicy::new(params.backoff),
            state: state_tx,
            shutdown: shutdown.clone(),
            params,
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            target,
            jobs,
            state: state_rx,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn attach(&self, job_id: JobId, kind: JobKind) {
        self.jobs.insert(job_id, kind);
    }

    pub fn detach(&self, job_id: &JobId) {
        self.jobs.remove(job_id);
    }

    pub fn has_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }

    /// Signals the supervisor to stop. Safe to call from inside a callback
    /// running on the supervisor itself.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stops the supervisor and waits until its link and timers are gone.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Supervisor {
    params: ConnectionParams,
    request: OpenRequest,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        match self.params.streaming.clone() {
            Some(streaming) => self.stream(streaming).await,
            None => {
                if self.policy.degrade().is_ok() {
                    self.publish();
                    self.poll().await;
                }
            }
        }
        if self.policy.state() != ConnectionState::Closed {
            self.policy.close();
            self.publish();
        }
        debug!(target = "job_sync.connection", stream = %self.params.target, "supervisor stopped");
    }

    async fn stream(&mut self, streaming: Arc<dyn Transport>) {
        if let Err(err) = self.policy.begin_open() {
            warn!(
                target = "job_sync.connection",
                stream = %self.params.target,
                error = %err,
                "cannot open"
            );
            return;
        }
        self.publish();

        loop {
            let opened = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                opened = streaming.open(&self.request) => opened,
            };

            let failure = match opened {
                Ok(link) => {
                    debug!(
                        target = "job_sync.connection",
                        stream = %self.params.target,
                        transport = %link.kind(),
                        "link open"
                    );
                    if let Err(err) = self.policy.on_connected() {
                        warn!(
                            target = "job_sync.connection",
                            stream = %self.params.target,
                            error = %err,
                            "rejected transition"
                        );
                        return;
                    }
                    self.publish();
                    match self.pump(link).await {
                        Some(failure) => failure,
                        None => return,
                    }
                }
                Err(err) => Failure::Transport(err),
            };

            match self.policy.on_failure(&failure) {
                Ok(Decision::Stop) => {
                    info!(
                        target = "job_sync.connection",
                        stream = %self.params.target,
                        "stream closed by server"
                    );
                    self.publish();
                    self.reconcile().await;
                    return;
                }
                Ok(Decision::Degrade) => {
                    let exhausted = SyncError::ReconnectExhausted {
                        attempts: self.policy.reconnect_state().attempts,
                    };
                    warn!(
                        target = "job_sync.connection",
                        stream = %self.params.target,
                        error = %exhausted,
                        last_failure = %failure,
                        "falling back to polling"
                    );
                    self.publish();
                    self.poll().await;
                    return;
                }
                Ok(Decision::Retry { delay, attempt }) => {
                    warn!(
                        target = "job_sync.connection",
                        stream = %self.params.target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "stream dropped; reconnecting"
                    );
                    self.publish();
                    if !self.backoff(delay).await {
                        return;
                    }
                    if let Err(err) = self.policy.begin_open() {
                        warn!(
                            target = "job_sync.connection",
                            stream = %self.params.target,
                            error = %err,
                            "rejected transition"
                        );
                        return;
                    }
                }
                Err(err) => {
                    warn!(
                        target = "job_sync.connection",
                        stream = %self.params.target,
                        error = %err,
                        "rejected transition"
                    );
                    return;
                }
            }
        }
    }

    /// Returns `None` when shutdown was requested.
    async fn pump(&mut self, mut link: Link) -> Option<Failure> {
        let ping_every = link.can_send().then_some(self.params.ping_interval);
        let mut monitor = HeartbeatMonitor::new(
            self.params.heartbeat_timeout,
            ping_every,
            &self.params.timers,
        );
        if link.can_send() {
            link.send(ControlMessage::GetStatus);
        }

        let failure = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    link.close().await;
                    return None;
                }
                event = link.recv() => {
                    monitor.touch();
                    match event {
                        None => break Failure::Closed { code: None, clean: false },
                        Some(RawEvent::StreamClosed { code, clean }) => {
                            break Failure::Closed { code, clean };
                        }
                        Some(RawEvent::StreamError(cause)) => {
                            break Failure::Transport(TransportError::Stream(cause));
                        }
                        Some(event) => {
                            if !self.handle(event).await {
                                link.close().await;
                                return None;
                            }
                        }
                    }
                }
                beat = monitor.next() => match beat {
                    Beat::Expired(after) => {
                        let timeout = SyncError::HeartbeatTimeout { after };
                        warn!(
                            target = "job_sync.heartbeat",
                            stream = %self.params.target,
                            error = %timeout,
                            "link presumed dead"
                        );
                        break Failure::HeartbeatTimeout(after);
                    }
                    Beat::Ping => {
                        if !link.send(ControlMessage::Ping) {
                            break Failure::Transport(TransportError::Closed { code: None });
                        }
                    }
                },
            }
        };
        drop(monitor);
        link.close().await;
        Some(failure)
    }

    /// Applies one non-terminal link event. Returns `false` on shutdown.
    async fn handle(&self, event: RawEvent) -> bool {
        match event {
            RawEvent::Snapshot(snapshot) => {
                if self.request.jobs.contains(&snapshot.job_id) {
                    self.deliver(snapshot);
                }
                true
            }
            RawEvent::Unattributed { status } => {
                info!(
                    target = "job_sync.connection",
                    stream = %self.params.target,
                    status = ?status,
                    "unattributed update; refreshing every attached job"
                );
                let _ = self.params.events.send(SyncEvent::RefreshAll {
                    target: self.params.target.clone(),
                });
                self.refresh().await
            }
            RawEvent::CancelResponse {
                job_id,
                accepted,
                message,
            } => {
                debug!(
                    target = "job_sync.connection",
                    stream = %self.params.target,
                    job_id = ?job_id.as_ref().map(JobId::as_str),
                    accepted,
                    message = ?message,
                    "cancel response"
                );
                true
            }
            RawEvent::Heartbeat => true,
            RawEvent::StreamError(_) | RawEvent::StreamClosed { .. } => true,
        }
    }

    fn deliver(&self, snapshot: JobSnapshot) {
        debug!(
            target = "job_sync.connection",
            stream = %self.params.target,
            job_id = %snapshot.job_id,
            status = %snapshot.status,
            "snapshot"
        );
        if let Some(sink) = self.params.sink.upgrade() {
            sink.dispatch(snapshot);
        }
    }

    /// Fetches and dispatches the snapshot of every attached job. Returns
    /// `false` if shutdown interrupted it.
    async fn refresh(&self) -> bool {
        let jobs = self.request.jobs.snapshot();
        let control = self.params.control.clone();
        let fetches = jobs.into_iter().map(|(job_id, kind)| {
            let control = control.clone();
            async move {
                let result = control.fetch_snapshot(kind, &job_id).await;
                (job_id, result)
            }
        });

        let results = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return false,
            results = join_all(fetches) => results,
        };
        for (job_id, result) in results {
            match result {
                Ok(snapshot) => self.deliver(snapshot),
                Err(err) => {
                    warn!(
                        target = "job_sync.connection",
                        stream = %self.params.target,
                        %job_id,
                        error = %err,
                        "refresh failed"
                    );
                }
            }
        }
        true
    }

    /// One-shot catch-up after a clean server-side close.
    async fn reconcile(&self) {
        if !self.request.jobs.is_empty() {
            self.refresh().await;
        }
    }

    /// Cancellable backoff wait. Returns `false` on shutdown.
    async fn backoff(&self, delay: Duration) -> bool {
        let _guard = self.params.timers.arm(TimerKind::Backoff);
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn poll(&mut self) {
        loop {
            let opened = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                opened = self.params.polling.open(&self.request) => opened,
            };
            match opened {
                Ok(mut link) => loop {
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            link.close().await;
                            return;
                        }
                        event = link.recv() => match event {
                            Some(event) => {
                                if !self.handle(event).await {
                                    link.close().await;
                                    return;
                                }
                            }
                            None => break,
                        },
                    }
                },
                Err(err) => {
                    warn!(
                        target = "job_sync.poll",
                        stream = %self.params.target,
                        error = %err,
                        "polling unavailable"
                    );
                }
            }
            if !self.backoff(self.params.poll_interval).await {
                return;
            }
        }
    }

    fn publish(&self) {
        let state = self.policy.state();
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if !changed {
            return;
        }
        let reconnect = self.policy.reconnect_state();
        info!(
            target = "job_sync.connection",
            stream = %self.params.target,
            %state,
            attempt = reconnect.attempts,
            "connection state"
        );
        let _ = self.params.events.send(SyncEvent::ConnectionState {
            target: self.params.target.clone(),
            state,
        });
    }
}
