//! Cancellation requests, reconciled against what the stream reports.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{CancelOutcome, ControlError, ControlPlane};
use crate::error::{SyncError, SyncResult};
use crate::registry::{Registry, TrackerHandle};
use crate::timers::{TimerKind, TimerLedger};
use crate::types::{JobId, JobKind, JobSnapshot, JobStatus};

pub const CANCEL_TIMED_OUT: &str = "cancel timed out";
pub const JOB_NOT_FOUND: &str = "job not found";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// The server accepted the request; the outcome arrives on the stream.
    Requested,
    /// The server no longer knows the job; it was settled locally as cancelled.
    AlreadyGone,
}

/// Receiver for locally synthesized snapshots.
pub trait SnapshotSink: Send + Sync {
    fn dispatch(&self, snapshot: JobSnapshot);

    /// Delivers `snapshot` to the given trackers only.
    fn dispatch_to(&self, handles: &[TrackerHandle], snapshot: JobSnapshot);
}

/// A grace timer and the trackers that were waiting when it was armed.
struct Armed {
    handles: Vec<TrackerHandle>,
    task: JoinHandle<()>,
}

type GraceTimers = Arc<Mutex<HashMap<JobId, Armed>>>;

pub struct CancelCoordinator {
    control: Arc<dyn ControlPlane>,
    registry: Arc<Registry>,
    sink: Weak<dyn SnapshotSink>,
    timers: TimerLedger,
    grace: Duration,
    armed: GraceTimers,
}

impl CancelCoordinator {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        registry: Arc<Registry>,
        sink: Weak<dyn SnapshotSink>,
        timers: TimerLedger,
        grace: Duration,
    ) -> Self {
        Self {
            control,
            registry,
            sink,
            timers,
            grace,
            armed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn cancel(&self, job_id: &JobId) -> SyncResult<CancelAck> {
        let kind = self
            .registry
            .kind_of(job_id)
            .ok_or_else(|| SyncError::NotTracked(job_id.clone()))?;

        match self.control.cancel(kind, job_id).await {
            Ok(CancelOutcome::Accepted) => {
                if self.arm(job_id, kind) {
                    info!(target = "job_sync.cancel", %job_id, %kind, "cancel requested");
                } else {
                    debug!(
                        target = "job_sync.cancel",
                        %job_id,
                        "job settled while the cancel request was in flight"
                    );
                }
                Ok(CancelAck::Requested)
            }
            Ok(CancelOutcome::NotFound) => {
                info!(
                    target = "job_sync.cancel",
                    %job_id,
                    %kind,
                    "job unknown to server; settling as cancelled"
                );
                if let Some(sink) = self.sink.upgrade() {
                    sink.dispatch(
                        JobSnapshot::new(job_id.clone(), kind, JobStatus::Cancelled)
                            .with_error(JOB_NOT_FOUND),
                    );
                }
                Ok(CancelAck::AlreadyGone)
            }
            Err(ControlError::UnexpectedStatus { status, body }) => {
                warn!(
                    target = "job_sync.cancel",
                    %job_id,
                    status = status.as_u16(),
                    "cancel rejected"
                );
                Err(SyncError::CancelRejected {
                    job_id: job_id.clone(),
                    status: status.as_u16(),
                    body,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Arms the grace timer for the trackers of `job_id` still waiting for
    /// a terminal state. Returns `false` when none are left.
    fn arm(&self, job_id: &JobId, kind: JobKind) -> bool {
        let mut armed = self.armed.lock();
        let pending = self.registry.pending_handles(job_id);
        if pending.is_empty() {
            if let Some(stale) = armed.remove(job_id) {
                stale.task.abort();
            }
            return false;
        }
        if let Some(existing) = armed.get_mut(job_id) {
            for handle in pending {
                if !existing.handles.contains(&handle) {
                    existing.handles.push(handle);
                }
            }
            return true;
        }

        let guard = self.timers.arm(TimerKind::CancelGrace);
        let grace = self.grace;
        let sink = self.sink.clone();
        let timers_map = self.armed.clone();
        let job = job_id.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(grace).await;
            let Some(expired) = timers_map.lock().remove(&job) else {
                return;
            };
            let Some(sink) = sink.upgrade() else {
                return;
            };
            warn!(
                target = "job_sync.cancel",
                job_id = %job,
                trackers = expired.handles.len(),
                grace_ms = grace.as_millis() as u64,
                "no terminal state after cancel"
            );
            sink.dispatch_to(
                &expired.handles,
                JobSnapshot::new(job.clone(), kind, JobStatus::Failed).with_error(CANCEL_TIMED_OUT),
            );
        });
        armed.insert(
            job_id.clone(),
            Armed {
                handles: pending,
                task,
            },
        );
        true
    }

    /// Unbinds a tracker that settled or was untracked. The grace timer is
    /// dropped with its last tracker.
    pub fn forget(&self, job_id: &JobId, handle: TrackerHandle) {
        let mut armed = self.armed.lock();
        let Some(entry) = armed.get_mut(job_id) else {
            return;
        };
        entry.handles.retain(|bound| *bound != handle);
        if entry.handles.is_empty() {
            if let Some(entry) = armed.remove(job_id) {
                entry.task.abort();
            }
        }
    }

    pub fn is_armed(&self, job_id: &JobId) -> bool {
        self.armed.lock().contains_key(job_id)
    }

    pub fn shutdown(&self) {
        for (_, entry) in self.armed.lock().drain() {
            entry.task.abort();
        }
    }

    /// Aborts every grace timer and waits until each is gone.
    pub async fn drain(&self) {
        let tasks: Vec<_> = self
            .armed
            .lock()
            .drain()
            .map(|(_, entry)| entry.task)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for CancelCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
