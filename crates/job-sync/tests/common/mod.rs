#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use job_sync::{
    CancelOutcome, ControlError, ControlMessage, ControlPlane, JobCallbacks, JobId, JobKind,
    JobSnapshot, JobStatus, Link, NotebookId, OpenRequest, RawEvent, SyncClient, SyncConfig,
    Transport, TransportError, TransportKind,
};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// What the next `open` call does.
pub enum Step {
    Fail(TransportError),
    Open(Vec<Play>),
}

/// One beat of an open link's script. A script that runs out without
/// `Hold` ends the link as if the socket vanished.
pub enum Play {
    Emit(RawEvent),
    Wait(Duration),
    Hold,
}

pub fn refused() -> Step {
    Step::Fail(TransportError::Connect("connection refused".into()))
}

pub struct ScriptedTransport {
    kind: TransportKind,
    steps: Mutex<VecDeque<Step>>,
    opens: AtomicUsize,
    sent: Arc<Mutex<Vec<ControlMessage>>>,
}

impl ScriptedTransport {
    pub fn new(kind: TransportKind, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            steps: Mutex::new(steps.into()),
            opens: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<ControlMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self, _request: &OpenRequest) -> Result<Link, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().pop_front().unwrap_or_else(refused);
        let plays = match step {
            Step::Fail(err) => return Err(err),
            Step::Open(plays) => plays,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            for play in plays {
                match play {
                    Play::Emit(event) => {
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                    Play::Wait(delay) => tokio::time::sleep(delay).await,
                    Play::Hold => std::future::pending::<()>().await,
                }
            }
        });

        let mut link = Link::new(self.kind, rx, Some(task));
        if self.kind == TransportKind::WebSocket {
            let (out_tx, mut out_rx) = mpsc::unbounded_channel();
            let sent = self.sent.clone();
            tokio::spawn(async move {
                while let Some(message) = out_rx.recv().await {
                    sent.lock().push(message);
                }
            });
            link = link.with_outbound(out_tx);
        }
        Ok(link)
    }
}

/// Control plane answering from canned snapshots. The last queued snapshot
/// of a job repeats forever.
#[derive(Default)]
pub struct MockControl {
    snapshots: Mutex<HashMap<JobId, VecDeque<JobSnapshot>>>,
    cancel_status: Mutex<HashMap<JobId, StatusCode>>,
    fetches: AtomicUsize,
    cancels: AtomicUsize,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue(&self, snapshot: JobSnapshot) {
        self.snapshots
            .lock()
            .entry(snapshot.job_id.clone())
            .or_default()
            .push_back(snapshot);
    }

    pub fn cancel_answers(&self, job_id: &str, status: StatusCode) {
        self.cancel_status.lock().insert(job_id.into(), status);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for MockControl {
    async fn submit(
        &self,
        kind: JobKind,
        _notebook_id: &NotebookId,
        _params: Map<String, Value>,
    ) -> Result<JobId, ControlError> {
        Ok(JobId::new(format!("{}-new", kind.as_str())))
    }

    async fn fetch_snapshot(
        &self,
        _kind: JobKind,
        job_id: &JobId,
    ) -> Result<JobSnapshot, ControlError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut snapshots = self.snapshots.lock();
        let queue = snapshots.get_mut(job_id);
        match queue {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().expect("non-empty queue")),
            Some(queue) if !queue.is_empty() => Ok(queue[0].clone()),
            _ => Err(ControlError::UnexpectedStatus {
                status: StatusCode::NOT_FOUND,
                body: String::new(),
            }),
        }
    }

    async fn cancel(&self, _kind: JobKind, job_id: &JobId) -> Result<CancelOutcome, ControlError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let status = self
            .cancel_status
            .lock()
            .get(job_id)
            .copied()
            .unwrap_or(StatusCode::OK);
        if status.is_success() {
            Ok(CancelOutcome::Accepted)
        } else if status == StatusCode::NOT_FOUND {
            Ok(CancelOutcome::NotFound)
        } else {
            Err(ControlError::UnexpectedStatus {
                status,
                body: "cannot cancel".into(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Progress(JobStatus, String),
    Complete(Option<Value>),
    Error(JobStatus, String),
}

pub fn recorder() -> (JobCallbacks, mpsc::UnboundedReceiver<(JobId, Seen)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (progress, complete, error) = (tx.clone(), tx.clone(), tx);
    let callbacks = JobCallbacks::new()
        .on_progress(move |snapshot| {
            let _ = progress.send((
                snapshot.job_id.clone(),
                Seen::Progress(snapshot.status, snapshot.progress.clone()),
            ));
        })
        .on_complete(move |snapshot| {
            let _ = complete.send((
                snapshot.job_id.clone(),
                Seen::Complete(snapshot.result.clone()),
            ));
        })
        .on_error(move |failure| {
            let _ = error.send((
                failure.job_id.clone(),
                Seen::Error(failure.status, failure.message.clone()),
            ));
        });
    (callbacks, rx)
}

pub async fn next_seen(rx: &mut mpsc::UnboundedReceiver<(JobId, Seen)>) -> (JobId, Seen) {
    tokio::time::timeout(Duration::from_secs(300), rx.recv())
        .await
        .expect("callback within timeout")
        .expect("callback channel open")
}

/// Lets spawned supervisors run until they park on a timer.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

pub fn snapshot(job: &str, kind: JobKind, status: JobStatus) -> JobSnapshot {
    JobSnapshot::new(job.into(), kind, status)
}

pub fn test_config() -> SyncConfig {
    SyncConfig::new("http://127.0.0.1:9/api")
}

pub fn client_with(
    config: SyncConfig,
    control: Arc<MockControl>,
    transports: Vec<Arc<ScriptedTransport>>,
) -> SyncClient {
    let mut builder = SyncClient::builder(config).control_plane(control);
    for transport in transports {
        builder = builder.transport(transport);
    }
    builder.build().expect("client")
}
