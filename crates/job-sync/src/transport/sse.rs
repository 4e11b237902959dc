use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Client;
use reqwest_eventsource::{Error as EsError, Event, EventSource};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{Link, OpenRequest, RawEvent, Transport, TransportKind};
use crate::config::{ConfigError, Endpoints, SyncConfig};
use crate::error::TransportError;
use crate::types::StreamTarget;
use crate::wire;

/// Server-sent events over `reqwest`. Retries are left to the caller's
/// reconnection policy: the event source is closed on its first error.
pub struct SseTransport {
    http: Client,
    endpoints: Endpoints,
    token: Option<String>,
}

impl SseTransport {
    pub fn new(config: &SyncConfig) -> Result<Self, ConfigError> {
        // No total timeout: the response body is the long-lived stream.
        let http = Client::builder()
            .connect_timeout(config.request_timeout())
            .build()
            .map_err(|err| ConfigError::Invalid(format!("http client: {err}")))?;
        Ok(Self {
            http,
            endpoints: config.endpoints()?,
            token: config.bearer_token.clone(),
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn open(&self, request: &OpenRequest) -> Result<Link, TransportError> {
        if matches!(request.target, StreamTarget::JobSocket { .. }) {
            return Err(TransportError::Endpoint(format!(
                "{} is not an event stream",
                request.target
            )));
        }
        let url = self.endpoints.stream_url(&request.target);
        let mut builder = self
            .http
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let mut source =
            EventSource::new(builder).map_err(|err| TransportError::Connect(err.to_string()))?;

        match source.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(_))) => {
                source.close();
                return Err(TransportError::Stream("message before open".into()));
            }
            Some(Err(err)) => {
                source.close();
                return Err(open_error(err, url.as_str()));
            }
            None => {
                return Err(TransportError::Closed { code: None });
            }
        }
        debug!(target = "job_sync.transport", %url, "event stream opened");

        let (tx_in, rx_in) = mpsc::unbounded_channel::<RawEvent>();
        let target = request.target.clone();
        let task = tokio::spawn(async move {
            pump_events(source, tx_in, target).await;
        });

        Ok(Link::new(TransportKind::Sse, rx_in, Some(task)))
    }
}

async fn pump_events(
    mut source: EventSource,
    tx_in: mpsc::UnboundedSender<RawEvent>,
    target: StreamTarget,
) {
    while let Some(next) = source.next().await {
        match next {
            Ok(Event::Open) => {}
            Ok(Event::Message(message)) => {
                trace!(
                    target = "job_sync.transport",
                    stream = %target,
                    event = %message.event,
                    "sse message"
                );
                let decoded = wire::decode_sse_message(&message.event, &message.data, &target);
                let events = match decoded {
                    Ok(events) if events.is_empty() => vec![RawEvent::Heartbeat],
                    Ok(events) => events,
                    Err(err) => {
                        warn!(
                            target = "job_sync.transport",
                            stream = %target,
                            error = %err,
                            "dropping malformed event"
                        );
                        vec![RawEvent::Heartbeat]
                    }
                };
                for event in events {
                    let closing = matches!(event, RawEvent::StreamClosed { .. });
                    if tx_in.send(event).is_err() || closing {
                        source.close();
                        return;
                    }
                }
            }
            Err(EsError::StreamEnded) => {
                let _ = tx_in.send(RawEvent::StreamClosed {
                    code: None,
                    clean: false,
                });
                break;
            }
            Err(err) => {
                let _ = tx_in.send(RawEvent::StreamError(err.to_string()));
                break;
            }
        }
    }
    source.close();
}

fn open_error(err: EsError, url: &str) -> TransportError {
    match err {
        EsError::InvalidStatusCode(status, _) => TransportError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        },
        EsError::StreamEnded => TransportError::Closed { code: None },
        other => TransportError::Connect(other.to_string()),
    }
}
