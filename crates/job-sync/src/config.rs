use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::reconnect::BackoffConfig;
use crate::transport::TransportKind;
use crate::types::{JobId, JobKind, NotebookId, StreamTarget};

pub const ENV_PREFIX: &str = "JOB_SYNC";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid {field} `{value}`: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Client configuration. Every field has a default so an empty environment
/// yields a usable local setup.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Origin for the job-status sockets; derived from `api_base_url` when unset.
    #[serde(default)]
    pub ws_base_url: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub streaming_enabled: bool,
    #[serde(default = "default_report_transport")]
    pub report_transport: TransportKind,
    #[serde(default = "default_sse_transport")]
    pub podcast_transport: TransportKind,
    #[serde(default = "default_sse_transport")]
    pub parse_transport: TransportKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ws_base_url: None,
            bearer_token: None,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            streaming_enabled: true,
            report_transport: default_report_transport(),
            podcast_transport: default_sse_transport(),
            parse_transport: default_sse_transport(),
        }
    }
}

impl SyncConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// Loads `JOB_SYNC_*` environment variables (nested keys use `__`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let loaded: SyncConfig = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        let cfg = loaded.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn normalize(mut self) -> Self {
        self.api_base_url = self.api_base_url.trim().to_string();
        self.ws_base_url = normalize_opt(self.ws_base_url.take());
        self.bearer_token = normalize_opt(self.bearer_token.take());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoints()?;
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Invalid("backoff_base_ms must be > 0".into()));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_base_ms ({}) exceeds backoff_cap_ms ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_reconnect_attempts must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("cancel_grace_ms", self.cancel_grace_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout_ms ({}) must be >= heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        for kind in [
            self.report_transport,
            self.podcast_transport,
            self.parse_transport,
        ] {
            if kind == TransportKind::Polling {
                return Err(ConfigError::Invalid(
                    "per-kind transports must be websocket or sse; \
                     set streaming_enabled=false to poll"
                        .into(),
                ));
            }
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn transport_for(&self, kind: JobKind) -> TransportKind {
        match kind {
            JobKind::Report => self.report_transport,
            JobKind::Podcast => self.podcast_transport,
            JobKind::Parse => self.parse_transport,
        }
    }

    /// Picks the stream a job is delivered over.
    pub fn target_for(
        &self,
        job_id: &JobId,
        kind: JobKind,
        notebook_id: &NotebookId,
    ) -> StreamTarget {
        match (self.transport_for(kind), kind) {
            (TransportKind::WebSocket, _) => StreamTarget::JobSocket {
                job_id: job_id.clone(),
                kind,
            },
            (_, JobKind::Parse) => StreamTarget::NotebookFiles {
                notebook_id: notebook_id.clone(),
            },
            _ => StreamTarget::JobStream {
                job_id: job_id.clone(),
                kind,
            },
        }
    }

    pub fn endpoints(&self) -> Result<Endpoints, ConfigError> {
        let api_base = parse_base("api_base_url", &self.api_base_url, &["http", "https"])?;
        let ws_base = match &self.ws_base_url {
            Some(raw) => parse_base("ws_base_url", raw, &["ws", "wss"])?,
            None => derive_ws_base(&api_base)?,
        };
        Ok(Endpoints { api_base, ws_base })
    }
}

/// Resolved endpoint URLs for the control plane and the status streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    api_base: Url,
    ws_base: Url,
}

impl Endpoints {
    pub fn submit_url(&self, kind: JobKind) -> Url {
        with_segments(&self.api_base, &["jobs", kind.as_str()], true)
    }

    pub fn snapshot_url(&self, kind: JobKind, job_id: &JobId) -> Url {
        with_segments(&self.api_base, &["jobs", kind.as_str(), job_id.as_str()], true)
    }

    pub fn cancel_url(&self, kind: JobKind, job_id: &JobId) -> Url {
        with_segments(
            &self.api_base,
            &["jobs", kind.as_str(), job_id.as_str(), "cancel"],
            true,
        )
    }

    pub fn stream_url(&self, target: &StreamTarget) -> Url {
        match target {
            StreamTarget::JobSocket { job_id, .. } => {
                with_segments(&self.ws_base, &["ws", "job-status", job_id.as_str()], false)
            }
            StreamTarget::JobStream { job_id, kind } => with_segments(
                &self.api_base,
                &["jobs", kind.as_str(), "stream", job_id.as_str()],
                false,
            ),
            StreamTarget::NotebookFiles { notebook_id } => with_segments(
                &self.api_base,
                &["notebooks", notebook_id.as_str(), "files", "stream"],
                false,
            ),
        }
    }
}

fn parse_base(field: &'static str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|err| ConfigError::InvalidUrl {
        field,
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            field,
            value: raw.to_string(),
            reason: format!("scheme must be one of {}", schemes.join(", ")),
        });
    }
    Ok(url)
}

fn derive_ws_base(api_base: &Url) -> Result<Url, ConfigError> {
    let mut ws = api_base.clone();
    let scheme = if api_base.scheme() == "https" { "wss" } else { "ws" };
    ws.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
        field: "api_base_url",
        value: api_base.to_string(),
        reason: "cannot derive websocket origin".into(),
    })?;
    ws.set_path("/");
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}

fn with_segments(base: &Url, segments: &[&str], trailing_slash: bool) -> Url {
    let mut url = base.clone();
    url.set_query(None);
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty();
        path.extend(segments);
        if trailing_slash {
            path.push("");
        }
    }
    url
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8000/api/v1".to_string()
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    15_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

fn default_cancel_grace_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_report_transport() -> TransportKind {
    TransportKind::WebSocket
}

fn default_sse_transport() -> TransportKind {
    TransportKind::Sse
}
