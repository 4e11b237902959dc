use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::timers::TimerLedger;
use crate::types::{JobId, JobKind, JobSnapshot, JobStatus, StreamTarget};

pub mod polling;
pub mod sse;
pub mod websocket;

pub use polling::PollingTransport;
pub use sse::SseTransport;
pub use websocket::WebSocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    #[serde(rename = "websocket", alias = "ws", alias = "web_socket")]
    WebSocket,
    #[serde(rename = "sse", alias = "eventsource")]
    Sse,
    #[serde(rename = "polling", alias = "poll")]
    Polling,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Sse => "sse",
            TransportKind::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed event surfaced by every transport, whatever its wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Snapshot(JobSnapshot),
    Heartbeat,
    /// A change or completion signal that names no job; consumers must
    /// re-fetch every job on the connection rather than guess.
    Unattributed { status: Option<JobStatus> },
    CancelResponse {
        job_id: Option<JobId>,
        accepted: bool,
        message: Option<String>,
    },
    StreamError(String),
    StreamClosed { code: Option<u16>, clean: bool },
}

/// Outbound messages for bidirectional transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping,
    /// Asks the server to replay the job's current state.
    GetStatus,
}

/// Jobs currently attached to a connection. Shared between the client, which
/// attaches and detaches trackers, and the polling transport, which reads it
/// on every tick.
#[derive(Debug, Clone, Default)]
pub struct JobSet {
    inner: Arc<RwLock<BTreeMap<JobId, JobKind>>>,
}

impl JobSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job_id: JobId, kind: JobKind) {
        self.inner.write().insert(job_id, kind);
    }

    pub fn remove(&self, job_id: &JobId) {
        self.inner.write().remove(job_id);
    }

    pub fn snapshot(&self) -> Vec<(JobId, JobKind)> {
        self.inner
            .read()
            .iter()
            .map(|(id, kind)| (id.clone(), *kind))
            .collect()
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.inner.read().contains_key(job_id)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub target: StreamTarget,
    pub jobs: JobSet,
    /// Ledger for timers a link arms for its own lifetime.
    pub timers: TimerLedger,
}

/// One open connection produced by a [`Transport`].
///
/// The background task that drives the socket is aborted when the link is
/// closed or dropped.
pub struct Link {
    kind: TransportKind,
    events: mpsc::UnboundedReceiver<RawEvent>,
    outbound: Option<mpsc::UnboundedSender<ControlMessage>>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    pub fn new(
        kind: TransportKind,
        events: mpsc::UnboundedReceiver<RawEvent>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            kind,
            events,
            outbound: None,
            task,
        }
    }

    pub fn with_outbound(mut self, outbound: mpsc::UnboundedSender<ControlMessage>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn can_send(&self) -> bool {
        self.outbound.is_some()
    }

    /// Next event, or `None` once the underlying stream is gone.
    pub async fn recv(&mut self) -> Option<RawEvent> {
        self.events.recv().await
    }

    /// Queues a control message. Returns `false` when the link cannot send or
    /// its writer has already shut down.
    pub fn send(&self, message: ControlMessage) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub async fn close(&mut self) {
        self.outbound = None;
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("kind", &self.kind)
            .field("can_send", &self.can_send())
            .finish()
    }
}

/// Strategy that turns a [`StreamTarget`] into a live [`Link`].
///
/// `open` resolves only once the handshake succeeded, so a returned link is
/// a connected one.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self, request: &OpenRequest) -> Result<Link, TransportError>;
}
