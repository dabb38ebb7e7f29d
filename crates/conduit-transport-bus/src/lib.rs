//! Socket.IO-family event-bus transport (§4.7.3). A single event,
//! `grpc_request_v2`, carries every cardinality: `(method_name, request_id,
//! metadata, bytes)`, where `bytes` travels base64-encoded since Socket.IO
//! payloads are JSON. UU replies through the event's ack in
//! `(error, result)` Node-callback shape; US pushes `<method>_<request_id>_reply`
//! events until a `<method>_<request_id>_end` terminator.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use conduit_core::dispatch::{Outcome, RequestBytes};
use conduit_core::{CancelToken, Codec, Metadata, MetaValue, Path};
use conduit_registry::Router;
use conduit_transport::{LifecycleGuard, Transport, TransportError};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socketioxide::extract::{AckSender, Data, SocketRef};
use socketioxide::SocketIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub address: String,
    pub port: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

struct Shared {
    router: Arc<Router>,
    codec: Arc<dyn Codec>,
}

pub struct BusTransport {
    shared: Arc<Shared>,
    config: BusConfig,
    lifecycle: LifecycleGuard,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl BusTransport {
    pub fn new(router: Arc<Router>, codec: Arc<dyn Codec>, config: BusConfig) -> Self {
        BusTransport {
            shared: Arc::new(Shared { router, codec }),
            config,
            lifecycle: LifecycleGuard::new(),
            local_addr: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait::async_trait]
impl Transport for BusTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let (layer, io) = SocketIo::new_layer();
        let shared = self.shared.clone();

        io.ns("/", move |socket: SocketRef| {
            let shared = shared.clone();
            socket.on("grpc_request_v2", move |socket: SocketRef, Data(payload): Data<RequestEnvelope>, ack: AckSender| {
                let shared = shared.clone();
                async move {
                    handle_request(shared, socket, payload, ack).await;
                }
            });
        });

        let app = axum::Router::new().layer(layer);

        let addr: SocketAddr = format!("{}:{}", self.config.address, self.config.port)
            .parse()
            .map_err(|err: std::net::AddrParseError| TransportError::Bind(err.to_string()))?;
        let listener = TcpListener::bind(addr).await.map_err(|err| TransportError::Bind(err.to_string()))?;
        let bound = listener.local_addr().map_err(|err| TransportError::Bind(err.to_string()))?;
        *self.local_addr.lock() = Some(bound);

        let (tx, rx) = oneshot::channel();
        *self.shutdown.lock() = Some(tx);

        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "event-bus transport server task exited with an error");
            }
        });

        self.lifecycle.mark_started();
        tracing::info!(%bound, "event-bus transport started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.lifecycle.mark_stopped() {
            tracing::warn!("event-bus transport stop() called without a prior start()");
            return;
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        tracing::info!("event-bus transport stopped");
    }
}

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    method_name: String,
    request_id: String,
    #[serde(default)]
    metadata: std::collections::BTreeMap<String, String>,
    bytes: String,
}

fn decode_payload(payload: &RequestEnvelope) -> Result<bytes::Bytes, ()> {
    base64::engine::general_purpose::STANDARD
        .decode(&payload.bytes)
        .map(bytes::Bytes::from)
        .map_err(|_| ())
}

fn envelope_metadata(payload: &RequestEnvelope) -> Metadata {
    payload
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), MetaValue::Str(v.clone())))
        .collect()
}

async fn handle_request(shared: Arc<Shared>, socket: SocketRef, payload: RequestEnvelope, ack: AckSender) {
    let Ok(bytes) = decode_payload(&payload) else {
        let _ = ack.send(&ack_error("invalid base64 payload"));
        return;
    };

    let path = Path::from(format!("/{}", payload.method_name));
    let Some(endpoint) = shared.router.route(&path) else {
        let _ = ack.send(&ack_error("not found"));
        return;
    };

    let metadata = envelope_metadata(&payload);

    if endpoint.cardinality.reply_is_stream() {
        let _ = ack.send(&ack_ok(""));
        let router = shared.router.clone();
        let codec = shared.codec.clone();
        let method_name = payload.method_name.clone();
        let request_id = payload.request_id.clone();
        tokio::spawn(async move {
            drive_stream(router, codec, path, bytes, metadata, socket, method_name, request_id).await;
        });
        return;
    }

    let outcome = conduit_core::dispatch::run(
        Arc::new(endpoint),
        shared.codec.clone(),
        RequestBytes::Unary(bytes),
        metadata,
        CancelToken::new(),
    )
    .await;

    match outcome {
        Outcome::Unary(Ok(value)) => {
            let encoded = shared.codec.encode(&value, &shared_reply_schema(&shared, &path));
            let text = base64::engine::general_purpose::STANDARD.encode(encoded);
            let _ = ack.send(&ack_ok(&text));
        }
        Outcome::Unary(Err(err)) => {
            let encoded = shared.codec.encode_error(&err);
            let text = base64::engine::general_purpose::STANDARD.encode(encoded);
            let _ = ack.send(&ack_err(&text));
        }
        Outcome::Streaming(_) => {
            tracing::error!(path = %path, "unary dispatch returned a stream outcome");
            let _ = ack.send(&ack_error("internal"));
        }
    }
}

/// Re-resolves the reply schema for the unary success path. A second
/// `route()` call is cheap -- `Router::route` is a read-locked hash lookup
/// -- and keeps `handle_request`'s ownership simple, since the endpoint
/// itself was already moved into `dispatch::run`.
fn shared_reply_schema(shared: &Shared, path: &Path) -> conduit_core::model::Schema {
    shared
        .router
        .route(path)
        .map(|endpoint| endpoint.reply_schema)
        .unwrap_or_else(|| conduit_core::model::Schema::new("unknown", vec![]))
}

async fn drive_stream(
    router: Arc<Router>,
    codec: Arc<dyn Codec>,
    path: Path,
    bytes: bytes::Bytes,
    metadata: Metadata,
    socket: SocketRef,
    method_name: String,
    request_id: String,
) {
    let reply_event = format!("{method_name}_{request_id}_reply");
    let end_event = format!("{method_name}_{request_id}_end");

    let outcome = conduit_transport::dispatch_typed(
        &router,
        codec,
        &path,
        RequestBytes::Unary(bytes),
        metadata,
        CancelToken::new(),
    )
    .await;

    let mut stream = match outcome {
        Outcome::Streaming(stream) => stream,
        _ => {
            let _ = socket.emit(end_event, &());
            return;
        }
    };

    while let Some(item) = stream.next().await {
        let text = base64::engine::general_purpose::STANDARD.encode(item);
        if socket.emit(reply_event.clone(), &text).is_err() {
            break;
        }
    }
    let _ = socket.emit(end_event, &());
}

fn ack_ok(payload: &str) -> (Option<String>, Option<String>) {
    (None, Some(payload.to_string()))
}

fn ack_err(encoded_error_base64: &str) -> (Option<String>, Option<String>) {
    (Some(encoded_error_base64.to_string()), None)
}

fn ack_error(message: &str) -> (Option<String>, Option<String>) {
    (Some(message.to_string()), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_loopback_with_auto_port() {
        let config = BusConfig::default();
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 0);
    }

    #[test]
    fn ack_ok_carries_no_error() {
        let (error, result) = ack_ok("payload");
        assert!(error.is_none());
        assert_eq!(result.as_deref(), Some("payload"));
    }

    #[test]
    fn ack_err_carries_no_result() {
        let (error, result) = ack_err("boom");
        assert_eq!(error.as_deref(), Some("boom"));
        assert!(result.is_none());
    }
}
