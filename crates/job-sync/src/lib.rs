//! Job Sync: keeps a consumer in step with long-running server-side jobs.
//!
//! Responsibilities:
//! - opening a status stream per job (WebSocket or SSE) or per notebook (multiplexed SSE)
//! - detecting dead connections with heartbeats and reconnecting with bounded backoff
//! - degrading to HTTP polling once streaming keeps failing
//! - delivering progress, and exactly one terminal callback, to every tracker of a job
//! - reconciling user-requested cancellation against what the stream reports

pub mod cancel;
pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod heartbeat;
pub mod reconnect;
pub mod registry;
pub mod timers;
pub mod transport;
pub mod types;
pub mod wire;

pub use cancel::CancelAck;
pub use client::{SyncClient, SyncClientBuilder, SyncEvent, Subscription};
pub use config::{ConfigError, SyncConfig};
pub use control::{CancelOutcome, ControlError, ControlPlane, HttpControlPlane};
pub use error::{SyncError, SyncResult, TransportError};
pub use reconnect::{BackoffConfig, ConnectionState, Decision, ReconnectPolicy, ReconnectState};
pub use registry::{JobCallbacks, JobFailure, TrackerHandle};
pub use transport::{ControlMessage, Link, OpenRequest, RawEvent, Transport, TransportKind};
pub use types::{JobId, JobKind, JobSnapshot, JobStatus, NotebookId, StreamTarget};
