use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::{ControlMessage, Link, OpenRequest, RawEvent, Transport, TransportKind};
use crate::config::{ConfigError, Endpoints, SyncConfig};
use crate::error::TransportError;
use crate::types::{JobId, JobKind};
use crate::wire;

/// WebSocket implementation of the Transport trait, one socket per job.
pub struct WebSocketTransport {
    endpoints: Endpoints,
    token: Option<String>,
}

impl WebSocketTransport {
    pub fn new(config: &SyncConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoints: config.endpoints()?,
            token: config.bearer_token.clone(),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&self, request: &OpenRequest) -> Result<Link, TransportError> {
        let (job_id, kind) = request.target.job().ok_or_else(|| {
            TransportError::Endpoint(format!("{} has no job socket", request.target))
        })?;
        let url = self.endpoints.stream_url(&request.target);

        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Endpoint(err.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| TransportError::Endpoint(err.to_string()))?;
            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = connect_async(ws_request).await.map_err(|err| match err {
            WsError::Http(response) => TransportError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            },
            other => TransportError::Connect(other.to_string()),
        })?;
        debug!(target = "job_sync.transport", %url, "websocket connected");

        let (tx_out, rx_out) = mpsc::unbounded_channel::<ControlMessage>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<RawEvent>();
        let job_id = job_id.clone();
        let task = tokio::spawn(async move {
            handle_websocket(ws_stream, rx_out, tx_in, job_id, kind).await;
        });

        Ok(Link::new(TransportKind::WebSocket, rx_in, Some(task)).with_outbound(tx_out))
    }
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<ControlMessage>,
    tx_in: mpsc::UnboundedSender<RawEvent>,
    job_id: JobId,
    kind: JobKind,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let closed = loop {
        tokio::select! {
            outbound = rx_out.recv() => {
                let Some(message) = outbound else {
                    let _ = ws_sender.close().await;
                    return;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(
                            target = "job_sync.transport",
                            error = %err,
                            "failed to encode control message"
                        );
                        continue;
                    }
                };
                if let Err(err) = ws_sender.send(Message::Text(text)).await {
                    break RawEvent::StreamError(format!("send failed: {err}"));
                }
            }
            inbound = ws_receiver.next() => {
                let event = match inbound {
                    Some(Ok(Message::Text(text))) => {
                        trace!(
                            target = "job_sync.transport",
                            %job_id,
                            frame = %text,
                            "websocket frame"
                        );
                        match wire::decode_socket_frame(&text, &job_id, kind) {
                            Ok(Some(event)) => event,
                            Ok(None) => RawEvent::Heartbeat,
                            Err(err) => {
                                warn!(
                                    target = "job_sync.transport",
                                    %job_id,
                                    error = %err,
                                    "dropping malformed frame"
                                );
                                RawEvent::Heartbeat
                            }
                        }
                    }
                    Some(Ok(
                        Message::Ping(_)
                        | Message::Pong(_)
                        | Message::Binary(_)
                        | Message::Frame(_),
                    )) => RawEvent::Heartbeat,
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|frame| u16::from(frame.code));
                        break RawEvent::StreamClosed {
                            code,
                            clean: is_clean_close(code),
                        };
                    }
                    Some(Err(err)) => {
                        debug!(
                            target = "job_sync.transport",
                            %job_id,
                            error = %err,
                            "websocket read failed"
                        );
                        break abnormal_close();
                    }
                    None => break abnormal_close(),
                };
                if tx_in.send(event).is_err() {
                    return;
                }
            }
        }
    };

    let _ = tx_in.send(closed);
}

fn abnormal_close() -> RawEvent {
    RawEvent::StreamClosed {
        code: Some(u16::from(CloseCode::Abnormal)),
        clean: false,
    }
}

fn is_clean_close(code: Option<u16>) -> bool {
    matches!(code, Some(1000) | Some(1001))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_normal_and_going_away_are_clean() {
        assert!(is_clean_close(Some(1000)));
        assert!(is_clean_close(Some(1001)));
        assert!(!is_clean_close(Some(1006)));
        assert!(!is_clean_close(Some(1011)));
        assert!(!is_clean_close(None));
    }

    #[test]
    fn abnormal_close_reports_1006() {
        assert_eq!(
            abnormal_close(),
            RawEvent::StreamClosed {
                code: Some(1006),
                clean: false
            }
        );
    }
}
