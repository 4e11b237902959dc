use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a server-side job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotebookId(String);

impl NotebookId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotebookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NotebookId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NotebookId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Report,
    Podcast,
    Parse,
}

impl JobKind {
    /// Path segment used by the control-plane and stream endpoints.
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Report => "report",
            JobKind::Podcast => "podcast",
            JobKind::Parse => "parse",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "report" | "research" => Ok(JobKind::Report),
            "podcast" | "panel" => Ok(JobKind::Podcast),
            "parse" | "file" | "upload" => Ok(JobKind::Parse),
            other => Err(format!("unknown job kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Maps the status spellings seen on the wire onto the canonical set.
    pub fn from_wire(value: &str) -> Option<Self> {
        let status = match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "submitted" | "waiting" => JobStatus::Pending,
            "running" | "processing" | "in_progress" | "generating" | "started" | "cancelling" => {
                JobStatus::Running
            }
            "completed" | "complete" | "success" | "succeeded" | "done" | "finished" => {
                JobStatus::Completed
            }
            "failed" | "failure" | "error" => JobStatus::Failed,
            "cancelled" | "canceled" | "aborted" => JobStatus::Cancelled,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of a job as reported by a transport or the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Free-form human text, e.g. "50%" or "Generating outline".
    #[serde(default)]
    pub progress: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn new(job_id: JobId, kind: JobKind, status: JobStatus) -> Self {
        Self {
            job_id,
            kind,
            status,
            progress: String::new(),
            result: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_progress(mut self, progress: impl Into<String>) -> Self {
        self.progress = progress.into();
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Identity of one live status connection.
///
/// Per-job endpoints are exclusive to their job; `NotebookFiles` multiplexes
/// every parse job of a notebook over a single stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamTarget {
    JobSocket { job_id: JobId, kind: JobKind },
    JobStream { job_id: JobId, kind: JobKind },
    NotebookFiles { notebook_id: NotebookId },
}

impl StreamTarget {
    /// The job bound to an exclusive target, `None` for multiplexed ones.
    pub fn job(&self) -> Option<(&JobId, JobKind)> {
        match self {
            StreamTarget::JobSocket { job_id, kind } | StreamTarget::JobStream { job_id, kind } => {
                Some((job_id, *kind))
            }
            StreamTarget::NotebookFiles { .. } => None,
        }
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self, StreamTarget::NotebookFiles { .. })
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTarget::JobSocket { job_id, kind } => write!(f, "ws:{kind}/{job_id}"),
            StreamTarget::JobStream { job_id, kind } => write!(f, "sse:{kind}/{job_id}"),
            StreamTarget::NotebookFiles { notebook_id } => write!(f, "sse:notebook/{notebook_id}"),
        }
    }
}
