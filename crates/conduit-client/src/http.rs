//! The HTTP/1.1 + WebSocket channel (§4.7.2's client side): unary calls ride
//! plain `POST`/response; streamed replies are pushed over a single
//! lazily-opened WebSocket connection this channel reuses for every stream
//! it starts, mirroring `conduit_transport_http`'s own connection/stream-id
//! framing exactly so the two sides interoperate.
//!
//! Client-streaming and bidi-streaming have no HTTP/WS wire encoding
//! (§4.7.2 only defines UU/US for this transport) -- `stream_unary` and
//! `stream_stream` always return [`ClientError::Unsupported`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use conduit_core::{BoxStream, Codec, Metadata, Model, Path, RpcError};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::model_codec::{decode_reply, encode_request};
use crate::stream::ReplyStream;
use crate::{Channel, ClientError};

const CONNECTION_ID_HEADER: &str = "connection-id";
const STREAM_ID_HEADER: &str = "stream-id";

/// Mirrors `conduit_transport_http`'s private `StreamFrame`, read instead of
/// written -- field names and shapes must match exactly for the two sides to
/// agree on the wire.
#[derive(Deserialize)]
struct ServerFrame {
    #[serde(rename = "streamId")]
    stream_id: Uuid,
    message: Option<String>,
    #[serde(default)]
    end: bool,
}

/// Mirrors `conduit_transport_http`'s private `ClientFrame`, the one message
/// this channel ever writes to the socket (a stream-cancellation request).
#[derive(Serialize)]
struct EndFrame {
    #[serde(rename = "streamId")]
    stream_id: Uuid,
    end: bool,
}

#[derive(Deserialize)]
struct HelloFrame {
    #[serde(rename = "connectionId")]
    connection_id: Uuid,
}

struct WsState {
    connection_id: Uuid,
    outbound: mpsc::UnboundedSender<WsMessage>,
    streams: Arc<DashMap<Uuid, mpsc::UnboundedSender<ServerFrame>>>,
}

pub struct HttpChannel {
    base_url: String,
    ws_url: String,
    http: reqwest::Client,
    codec: Arc<dyn Codec>,
    ws: Mutex<Option<Arc<WsState>>>,
}

impl HttpChannel {
    /// `base_url` is the transport's HTTP origin, e.g. `"http://127.0.0.1:8080"`.
    pub fn new(base_url: impl Into<String>, codec: Arc<dyn Codec>) -> Self {
        let base_url = base_url.into();
        let ws_url = to_ws_url(&base_url);
        HttpChannel {
            base_url,
            ws_url,
            http: reqwest::Client::new(),
            codec,
            ws: Mutex::new(None),
        }
    }

    async fn ensure_ws(&self) -> Result<Arc<WsState>, ClientError> {
        let mut guard = self.ws.lock().await;
        if let Some(state) = guard.as_ref() {
            return Ok(state.clone());
        }

        let (socket, _) = tokio_tungstenite::connect_async(&self.ws_url)
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        let (mut write, mut read) = socket.split();

        let hello = read
            .next()
            .await
            .ok_or_else(|| ClientError::Transport("websocket closed before handshake".to_string()))?
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        let WsMessage::Text(text) = hello else {
            return Err(ClientError::Protocol("expected a text handshake frame".to_string()));
        };
        let hello: HelloFrame = serde_json::from_str(&text)
            .map_err(|err| ClientError::Protocol(format!("malformed handshake frame: {err}")))?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let streams: Arc<DashMap<Uuid, mpsc::UnboundedSender<ServerFrame>>> = Arc::new(DashMap::new());

        let reader_streams = streams.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(message) => {
                                if write.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }

                    inbound = read.next() => {
                        match inbound {
                            Some(Ok(WsMessage::Text(text))) => {
                                if let Ok(frame) = serde_json::from_str::<ServerFrame>(&text) {
                                    let done = frame.end;
                                    if let Some(sender) = reader_streams.get(&frame.stream_id) {
                                        let _ = sender.send(frame);
                                    }
                                    if done {
                                        reader_streams.remove(&frame.stream_id);
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                tracing::debug!(error = %err, "websocket receive error");
                                break;
                            }
                        }
                    }
                }
            }
            reader_streams.clear();
        });

        let state = Arc::new(WsState {
            connection_id: hello.connection_id,
            outbound: outbound_tx,
            streams,
        });
        *guard = Some(state.clone());
        Ok(state)
    }
}

fn to_ws_url(base_url: &str) -> String {
    let stripped = base_url
        .strip_prefix("https://")
        .map(|rest| format!("wss://{rest}"))
        .or_else(|| base_url.strip_prefix("http://").map(|rest| format!("ws://{rest}")));
    format!("{}/ws", stripped.unwrap_or_else(|| base_url.to_string()))
}

/// URL form of a registered path per §6, reproduced from
/// `conduit_transport_http::url_form` (not exported): lowercase, dots
/// replaced with slashes.
fn url_form(path: &Path) -> String {
    path.as_str().to_lowercase().replace('.', "/")
}

fn content_type_for(codec: &dyn Codec) -> &'static str {
    if codec.name() == "json" {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

/// The reverse of `conduit_transport_http`'s `http_status_for`. The response
/// body for an error is codec-encoded, not a plain string, so the only
/// detail recoverable here is the status-derived error kind.
fn status_to_rpc_error(status: StatusCode) -> RpcError {
    match status {
        StatusCode::NOT_FOUND => RpcError::NotFound,
        StatusCode::UNPROCESSABLE_ENTITY => RpcError::InvalidArgument { field_violations: BTreeMap::new() },
        StatusCode::UNAUTHORIZED => RpcError::Unauthenticated,
        StatusCode::FORBIDDEN => RpcError::PermissionDenied,
        StatusCode::GATEWAY_TIMEOUT => RpcError::DeadlineExceeded,
        StatusCode::SERVICE_UNAVAILABLE => RpcError::Unavailable,
        status if status.as_u16() == 499 => RpcError::Cancelled,
        _ => RpcError::uncaught(),
    }
}

impl Channel for HttpChannel {
    async fn unary_unary<Req, Rep>(
        &self,
        path: &Path,
        request: Req,
        _metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<Rep, ClientError>
    where
        Req: Model + Send,
        Rep: Model + Send,
    {
        let bytes = encode_request(self.codec.as_ref(), &request);
        let url = format!("{}{}", self.base_url, url_form(path));
        let mut req = self
            .http
            .post(url)
            .header("content-type", content_type_for(self.codec.as_ref()))
            .body(bytes);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        let response = req.send().await.map_err(|err| ClientError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|err| ClientError::Transport(err.to_string()))?;
        if status.is_success() {
            decode_reply(self.codec.as_ref(), &body).map_err(ClientError::from)
        } else {
            Err(ClientError::Rpc(status_to_rpc_error(status)))
        }
    }

    async fn unary_stream<Req, Rep>(
        &self,
        path: &Path,
        request: Req,
        _metadata: Metadata,
    ) -> Result<ReplyStream<Rep>, ClientError>
    where
        Req: Model + Send,
        Rep: Model + Send + 'static,
    {
        let ws = self.ensure_ws().await?;
        let bytes = encode_request(self.codec.as_ref(), &request);
        let url = format!("{}{}", self.base_url, url_form(path));
        let response = self
            .http
            .post(url)
            .header(CONNECTION_ID_HEADER, ws.connection_id.to_string())
            .header("content-type", content_type_for(self.codec.as_ref()))
            .body(bytes)
            .send()
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let _ = body;
            return Err(ClientError::Rpc(status_to_rpc_error(status)));
        }

        let stream_id: Uuid = response
            .headers()
            .get(STREAM_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ClientError::Protocol("response is missing a Stream-Id header".to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
        ws.streams.insert(stream_id, tx);

        let codec = self.codec.clone();
        let items = async_stream::stream! {
            while let Some(frame) = rx.recv().await {
                if frame.end {
                    break;
                }
                let Some(encoded) = frame.message else { continue };
                match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded) {
                    Ok(decoded) => yield decode_reply::<Rep>(codec.as_ref(), &decoded),
                    Err(err) => yield Err(RpcError::ServerError { message: Some(format!("malformed frame payload: {err}")) }),
                }
            }
        };

        let outbound = ws.outbound.clone();
        let end_signal = move || {
            if let Ok(text) = serde_json::to_string(&EndFrame { stream_id, end: true }) {
                let _ = outbound.send(WsMessage::Text(text.into()));
            }
        };

        Ok(ReplyStream::new(Box::pin(items), Box::new(end_signal)))
    }

    async fn stream_unary<Req, Rep>(
        &self,
        _path: &Path,
        _requests: BoxStream<'static, Req>,
        _metadata: Metadata,
    ) -> Result<Rep, ClientError>
    where
        Req: Model + Send + 'static,
        Rep: Model + Send,
    {
        Err(ClientError::Unsupported("client-streaming is not supported over HTTP/WebSocket"))
    }

    async fn stream_stream<Req, Rep>(
        &self,
        _path: &Path,
        _requests: BoxStream<'static, Req>,
        _metadata: Metadata,
    ) -> Result<ReplyStream<Rep>, ClientError>
    where
        Req: Model + Send + 'static,
        Rep: Model + Send + 'static,
    {
        Err(ClientError::Unsupported("bidi-streaming is not supported over HTTP/WebSocket"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_form_lowercases_and_slashes_dots() {
        assert_eq!(url_form(&Path::from("/test.Echo/Call")), "/test/echo/call");
    }

    #[test]
    fn to_ws_url_rewrites_the_scheme() {
        assert_eq!(to_ws_url("http://127.0.0.1:8080"), "ws://127.0.0.1:8080/ws");
        assert_eq!(to_ws_url("https://example.com"), "wss://example.com/ws");
    }

    #[test]
    fn status_mapping_round_trips_the_common_cases() {
        assert_eq!(status_to_rpc_error(StatusCode::NOT_FOUND), RpcError::NotFound);
        assert_eq!(status_to_rpc_error(StatusCode::SERVICE_UNAVAILABLE), RpcError::Unavailable);
    }
}
