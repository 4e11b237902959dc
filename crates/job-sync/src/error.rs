use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::control::ControlError;
use crate::types::JobId;

/// Failures raised while opening or running a transport link.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("stream closed abnormally (code {code:?})")]
    Closed { code: Option<u16> },
    #[error("stream error: {0}")]
    Stream(String),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("transport {0} is not configured")]
    Unavailable(&'static str),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no heartbeat received for {}ms", .after.as_millis())]
    HeartbeatTimeout { after: Duration },
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
    #[error("cancel rejected for job {job_id}: status={status} body={body}")]
    CancelRejected {
        job_id: JobId,
        status: u16,
        body: String,
    },
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: JobId, message: String },
    #[error("job {0} is not tracked")]
    NotTracked(JobId),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("sync client is closed")]
    Closed,
}

pub type SyncResult<T> = Result<T, SyncError>;
