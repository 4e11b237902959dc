//! Job tracker registry: routes snapshots to subscriber callbacks and
//! guarantees exactly one terminal callback per tracker.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace};

use crate::error::SyncError;
use crate::types::{JobId, JobKind, JobSnapshot, JobStatus, NotebookId, StreamTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerHandle(u64);

impl TrackerHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Terminal failure handed to `on_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job_id: JobId,
    /// `Failed` or `Cancelled`.
    pub status: JobStatus,
    pub message: String,
}

impl JobFailure {
    pub fn from_snapshot(snapshot: &JobSnapshot) -> Option<Self> {
        let fallback = match snapshot.status {
            JobStatus::Failed => "job failed",
            JobStatus::Cancelled => "job cancelled",
            _ => return None,
        };
        Some(Self {
            job_id: snapshot.job_id.clone(),
            status: snapshot.status,
            message: snapshot
                .error_message
                .clone()
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| fallback.to_string()),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == JobStatus::Cancelled
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {} {}: {}", self.job_id, self.status, self.message)
    }
}

impl From<JobFailure> for SyncError {
    fn from(failure: JobFailure) -> Self {
        SyncError::JobFailed {
            job_id: failure.job_id,
            message: failure.message,
        }
    }
}

type SnapshotFn = Arc<dyn Fn(&JobSnapshot) + Send + Sync>;
type FailureFn = Arc<dyn Fn(&JobFailure) + Send + Sync>;

/// Subscriber callbacks for one tracked job. Every callback is optional.
#[derive(Clone, Default)]
pub struct JobCallbacks {
    on_progress: Option<SnapshotFn>,
    on_complete: Option<SnapshotFn>,
    on_error: Option<FailureFn>,
}

impl JobCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&JobSnapshot) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&JobSnapshot) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&JobFailure) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for JobCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// What `unregister`, `dispatch` and `drain` report for a removed tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub handle: TrackerHandle,
    pub job_id: JobId,
    pub target: StreamTarget,
    /// No tracker for this job remains.
    pub job_released: bool,
}

#[derive(Debug, Default)]
struct SlotState {
    last: Option<JobSnapshot>,
    delivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Progress,
    Terminal,
    Dropped,
}

struct TrackerSlot {
    handle: TrackerHandle,
    job_id: JobId,
    kind: JobKind,
    target: StreamTarget,
    callbacks: JobCallbacks,
    state: Mutex<SlotState>,
    live: AtomicBool,
    // Held for the duration of a callback. Reentrant so a callback may
    // unregister its own handle.
    gate: ReentrantMutex<()>,
}

impl TrackerSlot {
    fn deliver(&self, snapshot: &JobSnapshot) -> Delivery {
        let _gate = self.gate.lock();
        if !self.live.load(Ordering::Acquire) {
            return Delivery::Dropped;
        }
        let terminal = {
            let mut state = self.state.lock();
            if state.delivered {
                return Delivery::Dropped;
            }
            state.last = Some(snapshot.clone());
            state.delivered = snapshot.is_terminal();
            state.delivered
        };

        if !terminal {
            if let Some(on_progress) = &self.callbacks.on_progress {
                on_progress(snapshot);
            }
            return Delivery::Progress;
        }

        match JobFailure::from_snapshot(snapshot) {
            None => {
                if let Some(on_complete) = &self.callbacks.on_complete {
                    on_complete(snapshot);
                }
            }
            Some(failure) => {
                if let Some(on_error) = &self.callbacks.on_error {
                    on_error(&failure);
                }
            }
        }
        Delivery::Terminal
    }

    fn retire(&self) {
        self.live.store(false, Ordering::Release);
        // Waits for a callback running on another thread.
        drop(self.gate.lock());
    }

    fn is_delivered(&self) -> bool {
        self.state.lock().delivered
    }
}

#[derive(Default)]
struct Inner {
    trackers: HashMap<TrackerHandle, Arc<TrackerSlot>>,
    by_job: HashMap<JobId, Vec<TrackerHandle>>,
}

impl Inner {
    fn remove(&mut self, handle: TrackerHandle) -> Option<(Arc<TrackerSlot>, Detached)> {
        let slot = self.trackers.remove(&handle)?;
        let job_released = match self.by_job.get_mut(&slot.job_id) {
            Some(handles) => {
                handles.retain(|h| *h != handle);
                if handles.is_empty() {
                    self.by_job.remove(&slot.job_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };
        let detached = Detached {
            handle,
            job_id: slot.job_id.clone(),
            target: slot.target.clone(),
            job_released,
        };
        Some((slot, detached))
    }

    fn slots_for(&self, job_id: &JobId) -> Vec<Arc<TrackerSlot>> {
        self.by_job
            .get(job_id)
            .map(|handles| {
                handles
                    .iter()
                    .filter_map(|handle| self.trackers.get(handle).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct Registry {
    next_handle: AtomicU64,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        job_id: JobId,
        kind: JobKind,
        notebook_id: &NotebookId,
        target: StreamTarget,
        callbacks: JobCallbacks,
    ) -> TrackerHandle {
        let handle = TrackerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let slot = Arc::new(TrackerSlot {
            handle,
            job_id: job_id.clone(),
            kind,
            target,
            callbacks,
            state: Mutex::new(SlotState::default()),
            live: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
        });
        let mut inner = self.inner.lock();
        inner.trackers.insert(handle, slot);
        inner.by_job.entry(job_id.clone()).or_default().push(handle);
        debug!(
            target = "job_sync.registry",
            %job_id,
            %kind,
            %notebook_id,
            %handle,
            "tracker registered"
        );
        handle
    }

    /// Removes a tracker. No callback for `handle` runs once this returns.
    pub fn unregister(&self, handle: TrackerHandle) -> Option<Detached> {
        let removed = self.inner.lock().remove(handle);
        let (slot, detached) = removed?;
        slot.retire();
        debug!(
            target = "job_sync.registry",
            job_id = %detached.job_id,
            %handle,
            "tracker unregistered"
        );
        Some(detached)
    }

    /// Routes a snapshot to every tracker of its job. Trackers that just
    /// received their terminal callback are removed and returned.
    pub fn dispatch(&self, snapshot: &JobSnapshot) -> Vec<Detached> {
        let slots = self.inner.lock().slots_for(&snapshot.job_id);
        self.deliver_all(slots, snapshot)
    }

    /// Like [`Registry::dispatch`], restricted to the given trackers.
    pub fn dispatch_to(&self, handles: &[TrackerHandle], snapshot: &JobSnapshot) -> Vec<Detached> {
        let slots: Vec<_> = self
            .inner
            .lock()
            .slots_for(&snapshot.job_id)
            .into_iter()
            .filter(|slot| handles.contains(&slot.handle))
            .collect();
        self.deliver_all(slots, snapshot)
    }

    fn deliver_all(&self, slots: Vec<Arc<TrackerSlot>>, snapshot: &JobSnapshot) -> Vec<Detached> {
        if slots.is_empty() {
            trace!(
                target = "job_sync.registry",
                job_id = %snapshot.job_id,
                "no tracker for snapshot"
            );
            return Vec::new();
        }

        let mut finished = Vec::new();
        for slot in slots {
            match slot.deliver(snapshot) {
                Delivery::Terminal => finished.push(slot.handle),
                Delivery::Progress => {}
                Delivery::Dropped => {
                    trace!(
                        target = "job_sync.registry",
                        job_id = %snapshot.job_id,
                        handle = %slot.handle,
                        status = %snapshot.status,
                        "snapshot after terminal delivery dropped"
                    );
                }
            }
        }

        let mut inner = self.inner.lock();
        finished
            .into_iter()
            .filter_map(|handle| inner.remove(handle).map(|(_, detached)| detached))
            .collect()
    }

    /// Removes every tracker, e.g. on client shutdown.
    pub fn drain(&self) -> Vec<Detached> {
        let removed: Vec<_> = {
            let mut inner = self.inner.lock();
            let handles: Vec<_> = inner.trackers.keys().copied().collect();
            handles
                .into_iter()
                .filter_map(|handle| inner.remove(handle))
                .collect()
        };
        removed
            .into_iter()
            .map(|(slot, detached)| {
                slot.retire();
                detached
            })
            .collect()
    }

    pub fn contains(&self, handle: TrackerHandle) -> bool {
        self.inner.lock().trackers.contains_key(&handle)
    }

    /// Distinct jobs whose trackers depend on `target`.
    pub fn jobs_for(&self, target: &StreamTarget) -> Vec<(JobId, JobKind)> {
        let inner = self.inner.lock();
        let mut jobs: Vec<(JobId, JobKind)> = inner
            .trackers
            .values()
            .filter(|slot| &slot.target == target)
            .map(|slot| (slot.job_id.clone(), slot.kind))
            .collect();
        jobs.sort();
        jobs.dedup();
        jobs
    }

    pub fn kind_of(&self, job_id: &JobId) -> Option<JobKind> {
        self.inner
            .lock()
            .slots_for(job_id)
            .first()
            .map(|slot| slot.kind)
    }

    pub fn target_of(&self, job_id: &JobId) -> Option<StreamTarget> {
        self.inner
            .lock()
            .slots_for(job_id)
            .first()
            .map(|slot| slot.target.clone())
    }

    pub fn last_snapshot(&self, job_id: &JobId) -> Option<JobSnapshot> {
        let slots = self.inner.lock().slots_for(job_id);
        slots.iter().find_map(|slot| slot.state.lock().last.clone())
    }

    /// Trackers of `job_id` still waiting for their terminal state.
    pub fn pending_handles(&self, job_id: &JobId) -> Vec<TrackerHandle> {
        let slots = self.inner.lock().slots_for(job_id);
        slots
            .iter()
            .filter(|slot| !slot.is_delivered())
            .map(|slot| slot.handle)
            .collect()
    }

    /// True when no tracker of the job is still waiting for its terminal state.
    pub fn is_settled(&self, job_id: &JobId) -> bool {
        let slots = self.inner.lock().slots_for(job_id);
        slots.iter().all(|slot| slot.is_delivered())
    }

    pub fn tracked_jobs(&self) -> Vec<JobId> {
        let mut jobs: Vec<JobId> = self.inner.lock().by_job.keys().cloned().collect();
        jobs.sort();
        jobs
    }

    pub fn len(&self) -> usize {
        self.inner.lock().trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
