//! Decoding of status payloads shared by the socket, event-stream and
//! control-plane paths.
//!
//! Servers are not consistent about field names (`job_id` vs `id` vs
//! `file_id`, `error` vs `error_message`), so payloads are read from a
//! `serde_json::Value` field by field instead of through a rigid struct.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::transport::RawEvent;
use crate::types::{JobId, JobKind, JobSnapshot, JobStatus, StreamTarget};

const ID_FIELDS: &[&str] = &["job_id", "id", "file_id", "task_id"];
const LIST_FIELDS: &[&str] = &["files", "jobs", "snapshots", "data"];

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a json object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown job status `{0}`")]
    UnknownStatus(String),
}

/// Decodes one text frame from `/ws/job-status/{job_id}`.
///
/// Returns `Ok(None)` for frame types that carry nothing for the client.
pub fn decode_socket_frame(
    text: &str,
    job_id: &JobId,
    kind: JobKind,
) -> Result<Option<RawEvent>, WireError> {
    let value: Value = serde_json::from_str(text)?;
    let obj = value.as_object().ok_or(WireError::NotAnObject)?;
    let frame_type = str_field(obj, &["type", "event"]).unwrap_or_default();

    let event = match frame_type.as_str() {
        "status_update" | "job_status" | "progress" => {
            RawEvent::Snapshot(snapshot_from_object(obj, Some(job_id), kind, None)?)
        }
        "job_finished" | "job_complete" | "job_completed" => {
            let fallback = if error_text(obj).is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            RawEvent::Snapshot(snapshot_from_object(obj, Some(job_id), kind, Some(fallback))?)
        }
        "cancel_response" => RawEvent::CancelResponse {
            job_id: id_field(obj).or_else(|| Some(job_id.clone())),
            accepted: bool_field(obj, &["success", "accepted", "ok"]).unwrap_or(false),
            message: str_field(obj, &["message", "detail"]),
        },
        "pong" | "heartbeat" | "connected" | "connection_established" => RawEvent::Heartbeat,
        "error" => RawEvent::StreamError(error_message(obj)),
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Decodes one server-sent event. `event_name` is the SSE `event:` field
/// (`message` when absent); a `type` key in the JSON body takes precedence.
pub fn decode_sse_message(
    event_name: &str,
    data: &str,
    target: &StreamTarget,
) -> Result<Vec<RawEvent>, WireError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(match event_name {
            "heartbeat" | "ping" => vec![RawEvent::Heartbeat],
            "close" => vec![RawEvent::StreamClosed {
                code: None,
                clean: true,
            }],
            _ => Vec::new(),
        });
    }

    let value: Value = serde_json::from_str(data)?;
    let event_type = value
        .as_object()
        .and_then(|obj| str_field(obj, &["type"]))
        .unwrap_or_else(|| event_name.to_string());
    let (fallback_job, kind) = match target.job() {
        Some((job_id, kind)) => (Some(job_id), kind),
        None => (None, JobKind::Parse),
    };

    let events = match event_type.as_str() {
        "initial" => initial_snapshots(&value, fallback_job, kind)?,
        "file_change" | "status_update" | "job_update" | "job_status" | "update"
        | "job_finished" => {
            let obj = value.as_object().ok_or(WireError::NotAnObject)?;
            let obj = nested_object(obj).unwrap_or(obj);
            if fallback_job.is_none() && id_field(obj).is_none() {
                vec![RawEvent::Unattributed {
                    status: status_field(obj),
                }]
            } else {
                vec![RawEvent::Snapshot(snapshot_from_object(
                    obj,
                    fallback_job,
                    kind,
                    None,
                )?)]
            }
        }
        "heartbeat" | "ping" => vec![RawEvent::Heartbeat],
        "error" => {
            let message = match value.as_object() {
                Some(obj) => error_message(obj),
                None => "server reported an error".to_string(),
            };
            vec![RawEvent::StreamError(message)]
        }
        "close" | "closed" => vec![RawEvent::StreamClosed {
            code: None,
            clean: true,
        }],
        _ => Vec::new(),
    };
    Ok(events)
}

/// Decodes the body of `GET /jobs/{kind}/{job_id}/`.
pub fn decode_snapshot(
    value: &Value,
    job_id: &JobId,
    kind: JobKind,
) -> Result<JobSnapshot, WireError> {
    let obj = value.as_object().ok_or(WireError::NotAnObject)?;
    let obj = nested_object(obj).unwrap_or(obj);
    snapshot_from_object(obj, Some(job_id), kind, None)
}

/// Reads the job id out of a submit response.
pub fn decode_job_id(value: &Value) -> Result<JobId, WireError> {
    let obj = value.as_object().ok_or(WireError::NotAnObject)?;
    id_field(obj)
        .or_else(|| nested_object(obj).and_then(id_field))
        .ok_or(WireError::MissingField("job_id"))
}

fn initial_snapshots(
    value: &Value,
    fallback_job: Option<&JobId>,
    kind: JobKind,
) -> Result<Vec<RawEvent>, WireError> {
    let items = match value {
        Value::Array(items) => Some(items),
        Value::Object(obj) => LIST_FIELDS
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_array)),
        _ => None,
    };

    match items {
        Some(items) => {
            let mut events = Vec::with_capacity(items.len());
            for item in items {
                let Some(obj) = item.as_object() else {
                    continue;
                };
                if fallback_job.is_none() && id_field(obj).is_none() {
                    continue;
                }
                events.push(RawEvent::Snapshot(snapshot_from_object(
                    obj,
                    fallback_job,
                    kind,
                    None,
                )?));
            }
            Ok(events)
        }
        None => {
            // Exclusive streams may send their single job as the initial payload.
            let obj = value.as_object().ok_or(WireError::NotAnObject)?;
            if status_field(obj).is_none() || (fallback_job.is_none() && id_field(obj).is_none()) {
                return Ok(Vec::new());
            }
            Ok(vec![RawEvent::Snapshot(snapshot_from_object(
                obj,
                fallback_job,
                kind,
                None,
            )?)])
        }
    }
}

fn snapshot_from_object(
    obj: &Map<String, Value>,
    fallback_job: Option<&JobId>,
    kind: JobKind,
    fallback_status: Option<JobStatus>,
) -> Result<JobSnapshot, WireError> {
    let job_id = id_field(obj)
        .or_else(|| fallback_job.cloned())
        .ok_or(WireError::MissingField("job_id"))?;

    let status = match str_field(obj, &["status", "state"]) {
        Some(raw) => JobStatus::from_wire(&raw).ok_or(WireError::UnknownStatus(raw))?,
        None => fallback_status.ok_or(WireError::MissingField("status"))?,
    };

    let kind = str_field(obj, &["kind", "job_type"])
        .and_then(|raw| raw.parse::<JobKind>().ok())
        .unwrap_or(kind);

    let result = ["result", "result_url", "url"]
        .iter()
        .find_map(|key| obj.get(*key).filter(|v| !v.is_null()).cloned());

    let updated_at = str_field(obj, &["updated_at", "timestamp", "time"])
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(JobSnapshot {
        job_id,
        kind,
        status,
        progress: progress_text(obj),
        result,
        error_message: error_text(obj),
        updated_at,
    })
}

/// Some servers wrap the job under `job`/`snapshot`.
fn nested_object(obj: &Map<String, Value>) -> Option<&Map<String, Value>> {
    ["job", "snapshot"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_object))
}

fn id_field(obj: &Map<String, Value>) -> Option<JobId> {
    ID_FIELDS.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(JobId::new(s.trim())),
        Value::Number(n) => Some(JobId::new(n.to_string())),
        _ => None,
    })
}

fn status_field(obj: &Map<String, Value>) -> Option<JobStatus> {
    str_field(obj, &["status", "state"]).and_then(|raw| JobStatus::from_wire(&raw))
}

fn str_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) => Some(s.clone()),
        _ => None,
    })
}

fn bool_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| obj.get(*key)?.as_bool())
}

fn progress_text(obj: &Map<String, Value>) -> String {
    match obj.get("progress") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => format!("{n}%"),
        _ => str_field(obj, &["message", "progress_message"]).unwrap_or_default(),
    }
}

fn error_message(obj: &Map<String, Value>) -> String {
    error_text(obj)
        .or_else(|| str_field(obj, &["message", "detail"]))
        .unwrap_or_else(|| "server reported an error".to_string())
}

fn error_text(obj: &Map<String, Value>) -> Option<String> {
    for key in ["error", "error_message"] {
        match obj.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Object(inner)) => {
                if let Some(message) = str_field(inner, &["message", "detail"]) {
                    return Some(message);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report() -> (JobId, JobKind) {
        (JobId::from("r-1"), JobKind::Report)
    }

    #[test]
    fn socket_status_update_becomes_snapshot_for_the_socket_job() {
        let (job, kind) = report();
        let frame = r#"{"type":"status_update","status":"running","progress":"50%"}"#;
        let event = decode_socket_frame(frame, &job, kind).unwrap().unwrap();
        let RawEvent::Snapshot(snapshot) = event else {
            panic!("expected snapshot, got {event:?}");
        };
        assert_eq!(snapshot.job_id, job);
        assert_eq!(snapshot.status, JobStatus::Running);
        assert_eq!(snapshot.progress, "50%");
    }

    #[test]
    fn socket_job_finished_defaults_status_from_error_presence() {
        let (job, kind) = report();
        let done = decode_socket_frame(r#"{"type":"job_finished","result":"url"}"#, &job, kind)
            .unwrap()
            .unwrap();
        match done {
            RawEvent::Snapshot(s) => {
                assert_eq!(s.status, JobStatus::Completed);
                assert_eq!(s.result, Some(json!("url")));
            }
            other => panic!("unexpected {other:?}"),
        }

        let failed = decode_socket_frame(r#"{"type":"job_finished","error":"oom"}"#, &job, kind)
            .unwrap()
            .unwrap();
        match failed {
            RawEvent::Snapshot(s) => {
                assert_eq!(s.status, JobStatus::Failed);
                assert_eq!(s.error_message.as_deref(), Some("oom"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn socket_control_frames_map_to_events() {
        let (job, kind) = report();
        assert_eq!(
            decode_socket_frame(r#"{"type":"pong"}"#, &job, kind).unwrap(),
            Some(RawEvent::Heartbeat)
        );
        assert_eq!(
            decode_socket_frame(r#"{"type":"error","message":"boom"}"#, &job, kind).unwrap(),
            Some(RawEvent::StreamError("boom".into()))
        );
        assert_eq!(
            decode_socket_frame(r#"{"type":"error"}"#, &job, kind).unwrap(),
            Some(RawEvent::StreamError("server reported an error".into()))
        );
        assert_eq!(
            decode_socket_frame(
                r#"{"type":"cancel_response","success":true,"message":"ok"}"#,
                &job,
                kind
            )
            .unwrap(),
            Some(RawEvent::CancelResponse {
                job_id: Some(job.clone()),
                accepted: true,
                message: Some("ok".into()),
            })
        );
        assert_eq!(
            decode_socket_frame(r#"{"type":"welcome"}"#, &job, kind).unwrap(),
            None
        );
    }

    #[test]
    fn malformed_frames_are_errors_not_events() {
        let (job, kind) = report();
        assert!(matches!(
            decode_socket_frame("not json", &job, kind),
            Err(WireError::Json(_))
        ));
        assert!(matches!(
            decode_socket_frame(r#"{"type":"status_update","status":"weird"}"#, &job, kind),
            Err(WireError::UnknownStatus(_))
        ));
        assert!(matches!(
            decode_socket_frame("[1,2]", &job, kind),
            Err(WireError::NotAnObject)
        ));
    }

    #[test]
    fn notebook_initial_event_expands_into_snapshots() {
        let target = StreamTarget::NotebookFiles {
            notebook_id: "nb-1".into(),
        };
        let data = json!({
            "type": "initial",
            "files": [
                {"file_id": "f-1", "status": "processing", "progress": 40},
                {"file_id": "f-2", "status": "done"},
                {"status": "pending"}
            ]
        })
        .to_string();
        let events = decode_sse_message("message", &data, &target).unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            RawEvent::Snapshot(s) => {
                assert_eq!(s.job_id.as_str(), "f-1");
                assert_eq!(s.kind, JobKind::Parse);
                assert_eq!(s.progress, "40%");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &events[1] {
            RawEvent::Snapshot(s) => assert_eq!(s.status, JobStatus::Completed),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unattributed_change_on_multiplexed_stream_requests_refresh() {
        let target = StreamTarget::NotebookFiles {
            notebook_id: "nb-1".into(),
        };
        let events =
            decode_sse_message("file_change", r#"{"status":"completed"}"#, &target).unwrap();
        assert_eq!(
            events,
            vec![RawEvent::Unattributed {
                status: Some(JobStatus::Completed)
            }]
        );
    }

    #[test]
    fn per_job_stream_attributes_changes_to_its_job() {
        let target = StreamTarget::JobStream {
            job_id: "p-2".into(),
            kind: JobKind::Podcast,
        };
        let events = decode_sse_message(
            "message",
            r#"{"type":"job_update","status":"failed","error_message":"oom"}"#,
            &target,
        )
        .unwrap();
        match &events[..] {
            [RawEvent::Snapshot(s)] => {
                assert_eq!(s.job_id.as_str(), "p-2");
                assert_eq!(s.kind, JobKind::Podcast);
                assert_eq!(s.error_message.as_deref(), Some("oom"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sse_lifecycle_events() {
        let target = StreamTarget::JobStream {
            job_id: "p-2".into(),
            kind: JobKind::Podcast,
        };
        assert_eq!(
            decode_sse_message("heartbeat", "", &target).unwrap(),
            vec![RawEvent::Heartbeat]
        );
        assert_eq!(
            decode_sse_message("message", r#"{"type":"close"}"#, &target).unwrap(),
            vec![RawEvent::StreamClosed {
                code: None,
                clean: true
            }]
        );
        assert_eq!(
            decode_sse_message(
                "message",
                r#"{"type":"error","error":{"message":"db down"}}"#,
                &target
            )
            .unwrap(),
            vec![RawEvent::StreamError("db down".into())]
        );
        assert!(decode_sse_message("message", "", &target).unwrap().is_empty());
    }

    #[test]
    fn control_plane_bodies_decode() {
        let job = JobId::from("p-2");
        let body = json!({
            "job": {
                "id": "p-2",
                "status": "failed",
                "error": "oom",
                "updated_at": "2024-05-01T10:00:00Z"
            }
        });
        let snapshot = decode_snapshot(&body, &job, JobKind::Podcast).unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.error_message.as_deref(), Some("oom"));
        assert_eq!(snapshot.updated_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");

        assert_eq!(
            decode_job_id(&json!({"job_id": 42})).unwrap(),
            JobId::from("42")
        );
        assert!(matches!(
            decode_job_id(&json!({"ok": true})),
            Err(WireError::MissingField("job_id"))
        ));
    }
}
