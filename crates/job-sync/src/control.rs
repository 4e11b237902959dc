//! HTTP client for the job control plane: submit, snapshot fetch and cancel.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, Endpoints, SyncConfig};
use crate::types::{JobId, JobKind, JobSnapshot, NotebookId};
use crate::wire::{self, WireError};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("invalid response: {0}")]
    Decode(#[from] WireError),
}

/// Outcome of a cancel request the server answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Accepted,
    /// The server no longer knows the job (404).
    NotFound,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn submit(
        &self,
        kind: JobKind,
        notebook_id: &NotebookId,
        params: Map<String, Value>,
    ) -> Result<JobId, ControlError>;

    async fn fetch_snapshot(
        &self,
        kind: JobKind,
        job_id: &JobId,
    ) -> Result<JobSnapshot, ControlError>;

    async fn cancel(&self, kind: JobKind, job_id: &JobId) -> Result<CancelOutcome, ControlError>;
}

#[derive(Clone)]
pub struct HttpControlPlane {
    http: Client,
    endpoints: Endpoints,
    token: Option<String>,
}

impl HttpControlPlane {
    pub fn new(config: &SyncConfig) -> Result<Self, ConfigError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| ConfigError::Invalid(format!("http client: {err}")))?;
        Self::with_client(http, config)
    }

    pub fn with_client(http: Client, config: &SyncConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            http,
            endpoints: config.endpoints()?,
            token: config.bearer_token.clone(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn submit(
        &self,
        kind: JobKind,
        notebook_id: &NotebookId,
        mut params: Map<String, Value>,
    ) -> Result<JobId, ControlError> {
        params.insert(
            "notebook_id".to_string(),
            Value::String(notebook_id.to_string()),
        );
        let url = self.endpoints.submit_url(kind);
        let res = self
            .authorize(self.http.post(url))
            .json(&Value::Object(params))
            .send()
            .await?;

        if res.status().is_success() {
            let body: Value = res.json().await?;
            let job_id = wire::decode_job_id(&body)?;
            debug!(target = "job_sync.control", %kind, %job_id, "job submitted");
            Ok(job_id)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ControlError::UnexpectedStatus { status, body })
        }
    }

    async fn fetch_snapshot(
        &self,
        kind: JobKind,
        job_id: &JobId,
    ) -> Result<JobSnapshot, ControlError> {
        let url = self.endpoints.snapshot_url(kind, job_id);
        let res = self.authorize(self.http.get(url)).send().await?;

        if res.status().is_success() {
            let body: Value = res.json().await?;
            Ok(wire::decode_snapshot(&body, job_id, kind)?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ControlError::UnexpectedStatus { status, body })
        }
    }

    async fn cancel(&self, kind: JobKind, job_id: &JobId) -> Result<CancelOutcome, ControlError> {
        let url = self.endpoints.cancel_url(kind, job_id);
        let res = self.authorize(self.http.post(url)).send().await?;

        match res.status() {
            status if status.is_success() => Ok(CancelOutcome::Accepted),
            StatusCode::NOT_FOUND => Ok(CancelOutcome::NotFound),
            status => {
                let body = res.text().await.unwrap_or_default();
                Err(ControlError::UnexpectedStatus { status, body })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    fn control(base: String) -> HttpControlPlane {
        HttpControlPlane::new(&SyncConfig::new(base)).expect("control plane")
    }

    #[tokio::test]
    async fn submit_posts_notebook_and_reads_job_id() {
        let router = Router::new().route(
            "/api/jobs/report/",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["notebook_id"], "nb-1");
                assert_eq!(body["topic"], "tides");
                Json(json!({"job_id": "r-9"}))
            }),
        );
        let plane = control(serve(router).await);
        let mut params = Map::new();
        params.insert("topic".into(), json!("tides"));
        let job = plane
            .submit(JobKind::Report, &"nb-1".into(), params)
            .await
            .unwrap();
        assert_eq!(job, JobId::from("r-9"));
    }

    #[tokio::test]
    async fn fetch_snapshot_decodes_status_body() {
        let router = Router::new().route(
            "/api/jobs/podcast/:id/",
            get(|Path(id): Path<String>| async move {
                Json(json!({"job_id": id, "status": "running", "progress": "Recording"}))
            }),
        );
        let plane = control(serve(router).await);
        let snapshot = plane
            .fetch_snapshot(JobKind::Podcast, &"p-2".into())
            .await
            .unwrap();
        assert_eq!(snapshot.job_id.as_str(), "p-2");
        assert_eq!(snapshot.progress, "Recording");
    }

    #[tokio::test]
    async fn cancel_maps_not_found_and_rejections() {
        let router = Router::new()
            .route(
                "/api/jobs/report/gone/cancel/",
                post(|| async { AxumStatus::NOT_FOUND }),
            )
            .route(
                "/api/jobs/report/live/cancel/",
                post(|| async { Json(json!({"status": "cancelling"})) }),
            )
            .route(
                "/api/jobs/report/done/cancel/",
                post(|| async { (AxumStatus::CONFLICT, "already completed") }),
            );
        let plane = control(serve(router).await);

        assert_eq!(
            plane.cancel(JobKind::Report, &"gone".into()).await.unwrap(),
            CancelOutcome::NotFound
        );
        assert_eq!(
            plane.cancel(JobKind::Report, &"live".into()).await.unwrap(),
            CancelOutcome::Accepted
        );
        match plane.cancel(JobKind::Report, &"done".into()).await {
            Err(ControlError::UnexpectedStatus { status, body }) => {
                assert_eq!(status, StatusCode::CONFLICT);
                assert_eq!(body, "already completed");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
