//! HTTP/1.1 + WebSocket transport (§4.7.2): unary calls over plain
//! `POST`/response, streaming replies multiplexed over a single WebSocket
//! connection the client opens once and reuses for every stream it starts.
//!
//! Path canonicalization (§6): the registry keeps endpoints under their
//! canonical `/<package>.<Service>/<Method>` path, but URLs are
//! case-insensitive and dot-hostile, so this adapter lowercases and
//! dot-to-slashes every registered path once at [`HttpTransport::start`] and
//! keeps a side table mapping the URL form back to the canonical `Path`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path as AxumPath, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, options, post};
use bytes::Bytes;
use conduit_core::dispatch::{Outcome, RequestBytes};
use conduit_core::{CancelToken, Codec, Metadata, Path, RpcError};
use conduit_registry::Router;
use conduit_transport::{LifecycleGuard, Transport, TransportError};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

const CONNECTION_ID_HEADER: &str = "connection-id";
const STREAM_ID_HEADER: &str = "stream-id";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Port to bind. `0` asks the OS for an ephemeral port, read back via
    /// [`HttpTransport::local_addr`] -- handy for tests and for the
    /// multiprocess worker-pool variant's supervisor.
    pub port: u16,
    /// Value echoed back as `Access-Control-Allow-Origin`. `None` omits CORS
    /// headers entirely.
    pub cors_allow: Option<String>,
    pub max_message_size_kb: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            port: 0,
            cors_allow: None,
            max_message_size_kb: 4096,
        }
    }
}

/// One open WebSocket, keyed by the `Connection-Id` a client mints and sends
/// as the first frame after upgrade. Every stream a client starts over
/// `POST` rides this connection's outbound half; `cancels` lets an inbound
/// "end" frame reach the right running stream.
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    cancels: DashMap<Uuid, CancelToken>,
}

struct Shared {
    router: Arc<Router>,
    codec: Arc<dyn Codec>,
    config: HttpConfig,
    connections: DashMap<Uuid, Arc<Connection>>,
    url_index: DashMap<String, Path>,
}

impl Shared {
    fn resolve(&self, url_path: &str) -> Option<Path> {
        self.url_index.get(url_path).map(|entry| entry.clone())
    }
}

/// URL form of a registered path per §6: lowercase, dots replaced with
/// slashes. `/pkg.Svc/Method` becomes `/pkg/svc/method`.
fn url_form(path: &Path) -> String {
    path.as_str().to_lowercase().replace('.', "/")
}

pub struct HttpTransport {
    shared: Arc<Shared>,
    lifecycle: LifecycleGuard,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl HttpTransport {
    pub fn new(router: Arc<Router>, codec: Arc<dyn Codec>, config: HttpConfig) -> Self {
        HttpTransport {
            shared: Arc::new(Shared {
                router,
                codec,
                config,
                connections: DashMap::new(),
                url_index: DashMap::new(),
            }),
            lifecycle: LifecycleGuard::new(),
            local_addr: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    /// The bound address, available once [`start`](Transport::start) has
    /// returned -- the actual port when `config.port == 0`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn build_router(shared: Arc<Shared>) -> axum::Router {
        axum::Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/{*rest}", post(call_http))
            .route("/{*rest}", options(preflight))
            .with_state(shared)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.shared.url_index.clear();
        for endpoint in self.shared.router.entries() {
            self.shared.url_index.insert(url_form(&endpoint.path), endpoint.path.clone());
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.shared.config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| TransportError::Bind(err.to_string()))?;
        let bound = listener.local_addr().map_err(|err| TransportError::Bind(err.to_string()))?;
        *self.local_addr.lock() = Some(bound);

        let (tx, rx) = oneshot::channel();
        *self.shutdown.lock() = Some(tx);

        let app = Self::build_router(self.shared.clone());
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "http transport server task exited with an error");
            }
        });

        self.lifecycle.mark_started();
        tracing::info!(%bound, "http transport started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.lifecycle.mark_stopped() {
            tracing::warn!("http transport stop() called without a prior start()");
            return;
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        tracing::info!("http transport stopped");
    }
}

fn cors_headers(config: &HttpConfig, headers: &mut HeaderMap) {
    let Some(allow) = &config.cors_allow else { return };
    if let Ok(value) = HeaderValue::from_str(allow) {
        headers.insert("access-control-allow-origin", value);
    }
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Connection-Id, Stream-Id, Content-Type"),
    );
    headers.insert("access-control-allow-methods", HeaderValue::from_static("OPTIONS, POST"));
}

async fn preflight(State(shared): State<Arc<Shared>>, AxumPath(_rest): AxumPath<String>) -> Response {
    let mut headers = HeaderMap::new();
    cors_headers(&shared.config, &mut headers);
    headers.insert("allow", HeaderValue::from_static("OPTIONS, POST"));
    (StatusCode::NO_CONTENT, headers).into_response()
}

/// HTTP status a transport with its own status channel picks for an
/// `RpcError` that never makes it into an encoded error body (§7).
fn http_status_for(err: &RpcError) -> StatusCode {
    match err {
        RpcError::NotFound => StatusCode::NOT_FOUND,
        RpcError::InvalidArgument { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RpcError::Unauthenticated => StatusCode::UNAUTHORIZED,
        RpcError::PermissionDenied => StatusCode::FORBIDDEN,
        RpcError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        RpcError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        RpcError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        RpcError::ServerError { .. } | RpcError::Internal | RpcError::Unknown => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn content_type_for(codec: &dyn Codec) -> &'static str {
    if codec.name() == "json" {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

/// `POST /{*rest}`: the unary starter for both UU and US cardinalities. UU
/// runs to completion and returns the encoded reply inline; US returns
/// immediately with a `Stream-Id` and pushes every item over the caller's
/// already-open WebSocket connection.
async fn call_http(
    State(shared): State<Arc<Shared>>,
    AxumPath(rest): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url_path = format!("/{rest}");
    let Some(path) = shared.resolve(&url_path) else {
        return error_response(&shared, RpcError::NotFound);
    };
    let Some(endpoint) = shared.router.route(&path) else {
        return error_response(&shared, RpcError::NotFound);
    };

    let metadata = Metadata::new();
    let request = RequestBytes::Unary(body);

    if endpoint.cardinality.reply_is_stream() {
        let Some(connection_id) = headers
            .get(CONNECTION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
        else {
            return error_response(
                &shared,
                RpcError::InvalidArgument {
                    field_violations: vec![("Connection-Id".into(), "required header missing or malformed".into())]
                        .into_iter()
                        .collect(),
                },
            );
        };
        let Some(connection) = shared.connections.get(&connection_id).map(|c| c.clone()) else {
            return error_response(
                &shared,
                RpcError::InvalidArgument {
                    field_violations: vec![("Connection-Id".into(), "no open connection with this id".into())]
                        .into_iter()
                        .collect(),
                },
            );
        };

        let stream_id = Uuid::new_v4();
        let cancel = CancelToken::new();
        connection.cancels.insert(stream_id, cancel.clone());

        let codec = shared.codec.clone();
        let router = shared.router.clone();
        tokio::spawn(drive_stream(router, codec, path, request, metadata, cancel, stream_id, connection));

        let mut response_headers = HeaderMap::new();
        cors_headers(&shared.config, &mut response_headers);
        response_headers.insert(STREAM_ID_HEADER, HeaderValue::from_str(&stream_id.to_string()).unwrap());
        return (StatusCode::CREATED, response_headers).into_response();
    }

    match conduit_core::dispatch::run(Arc::new(endpoint.clone()), shared.codec.clone(), request, metadata, CancelToken::new())
        .await
    {
        Outcome::Unary(Ok(value)) => {
            let bytes = shared.codec.encode(&value, &endpoint.reply_schema);
            let mut response_headers = HeaderMap::new();
            cors_headers(&shared.config, &mut response_headers);
            response_headers.insert("content-type", HeaderValue::from_static(content_type_for(shared.codec.as_ref())));
            (StatusCode::CREATED, response_headers, bytes).into_response()
        }
        Outcome::Unary(Err(err)) => error_response(&shared, err),
        Outcome::Streaming(_) => {
            tracing::error!(path = %path, "unary dispatch returned a stream outcome");
            error_response(&shared, RpcError::uncaught())
        }
    }
}

fn error_response(shared: &Shared, err: RpcError) -> Response {
    let status = http_status_for(&err);
    let bytes = shared.codec.encode_error(&err);
    let mut headers = HeaderMap::new();
    cors_headers(&shared.config, &mut headers);
    headers.insert("content-type", HeaderValue::from_static(content_type_for(shared.codec.as_ref())));
    (status, headers, bytes).into_response()
}

/// Framing for the stream items a `GET /ws` connection receives, and the
/// `end` frame a client sends to cancel a stream it started. There is no
/// separate error-frame shape (§9 open question 2): a failed stream's error
/// arrives as one more `message`, codec-encoded exactly like a successful
/// item, followed by the terminal `end` frame.
#[derive(Serialize)]
struct StreamFrame {
    #[serde(rename = "streamId")]
    stream_id: Uuid,
    message: Option<String>,
    end: bool,
}

#[derive(Deserialize)]
struct ClientFrame {
    #[serde(rename = "streamId")]
    stream_id: Uuid,
    #[serde(default)]
    end: bool,
}

async fn drive_stream(
    router: Arc<Router>,
    codec: Arc<dyn Codec>,
    path: Path,
    request: RequestBytes,
    metadata: Metadata,
    cancel: CancelToken,
    stream_id: Uuid,
    connection: Arc<Connection>,
) {
    use futures_util::StreamExt;

    let outcome = conduit_transport::dispatch_typed(&router, codec.clone(), &path, request, metadata, cancel).await;
    let mut stream = match outcome {
        Outcome::Streaming(stream) => stream,
        Outcome::Unary(Err(err)) => {
            send_frame(&connection, stream_id, Some(codec.encode_error(&err)));
            send_frame(&connection, stream_id, None);
            connection.cancels.remove(&stream_id);
            return;
        }
        Outcome::Unary(Ok(_)) => {
            tracing::error!(path = %path, "streaming dispatch returned a unary outcome");
            connection.cancels.remove(&stream_id);
            return;
        }
    };

    while let Some(item) = stream.next().await {
        send_frame(&connection, stream_id, Some(item));
    }
    send_frame(&connection, stream_id, None);
    connection.cancels.remove(&stream_id);
}

fn send_frame(connection: &Connection, stream_id: Uuid, message: Option<Bytes>) {
    let end = message.is_none();
    let encoded = message.map(|bytes| base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes));
    let frame = StreamFrame { stream_id, message: encoded, end };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = connection.outbound.send(Message::Text(text.into()));
    }
}

async fn ws_upgrade(State(shared): State<Arc<Shared>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_connection(shared, socket))
}

/// The lifetime of one WebSocket connection: mint a connection id, announce
/// it, then multiplex the socket's inbound frames (stream-cancellation
/// requests) against the outbound queue every spawned stream driver feeds.
async fn ws_connection(shared: Arc<Shared>, mut socket: WebSocket) {
    let connection_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection = Arc::new(Connection {
        outbound: tx,
        cancels: DashMap::new(),
    });
    shared.connections.insert(connection_id, connection.clone());

    let hello = serde_json::json!({ "connectionId": connection_id.to_string() });
    if socket.send(Message::Text(hello.to_string().into())).await.is_err() {
        shared.connections.remove(&connection_id);
        return;
    }

    loop {
        tokio::select! {
            biased;

            outbound = rx.recv() => {
                match outbound {
                    Some(message) => {
                        if socket.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) {
                            if frame.end {
                                if let Some((_, cancel)) = connection.cancels.remove(&frame.stream_id) {
                                    cancel.cancel();
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    for entry in connection.cancels.iter() {
        entry.value().cancel();
    }
    shared.connections.remove(&connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::endpoint::{BoxFuture, Endpoint, Handler, HandlerArgs, ReplyOutput, RequestInput};
    use conduit_core::model::{Cardinality, FieldSchema, LogicalType, Schema, Value};

    struct EchoCodec;

    impl Codec for EchoCodec {
        fn decode(&self, bytes: &[u8], _schema: &Schema) -> Result<Value, RpcError> {
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }

        fn encode(&self, value: &Value, _schema: &Schema) -> Bytes {
            match value {
                Value::String(s) => Bytes::from(s.clone().into_bytes()),
                _ => Bytes::new(),
            }
        }

        fn encode_error(&self, err: &RpcError) -> Bytes {
            Bytes::from(format!("error:{}", err.kind_name()))
        }

        fn name(&self) -> &'static str {
            "json"
        }
    }

    struct EchoHandler;

    impl Handler for EchoHandler {
        fn call(&self, args: HandlerArgs) -> BoxFuture<'static, Result<ReplyOutput, RpcError>> {
            Box::pin(async move {
                match args.request {
                    RequestInput::Unary(value) => Ok(ReplyOutput::Unary(value)),
                    RequestInput::Stream(_) => Err(RpcError::Internal),
                }
            })
        }
    }

    fn echo_schema() -> Schema {
        Schema::new(
            "test.Echo",
            vec![FieldSchema { name: "value".into(), ty: LogicalType::String }],
        )
    }

    fn test_router() -> Arc<Router> {
        let router = Router::new();
        router.register(
            Path::from("/test.Echo/Call"),
            Cardinality::UnaryUnary,
            echo_schema(),
            echo_schema(),
            Arc::new(EchoHandler),
            vec![],
            vec![],
        );
        Arc::new(router)
    }

    #[test]
    fn url_form_lowercases_and_slashes_dots() {
        let path = Path::from("/test.Echo/Call");
        assert_eq!(url_form(&path), "/test/echo/call");
    }

    #[tokio_test_lite::test]
    async fn start_binds_an_ephemeral_port_and_populates_url_index() {
        let transport = HttpTransport::new(test_router(), Arc::new(EchoCodec), HttpConfig::default());
        transport.start().await.unwrap();
        assert!(transport.local_addr().is_some());
        assert_eq!(
            transport.shared.resolve("/test/echo/call"),
            Some(Path::from("/test.Echo/Call"))
        );
        transport.stop().await;
    }

    #[tokio_test_lite::test]
    async fn stop_without_start_warns_and_is_a_no_op() {
        let transport = HttpTransport::new(test_router(), Arc::new(EchoCodec), HttpConfig::default());
        transport.stop().await;
        assert!(transport.local_addr().is_none());
    }

    #[test]
    fn http_status_mapping_matches_error_kind() {
        assert_eq!(http_status_for(&RpcError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            http_status_for(&RpcError::InvalidArgument { field_violations: Default::default() }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(http_status_for(&RpcError::uncaught()), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
