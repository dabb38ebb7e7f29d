//! Binary-RPC over HTTP/2 (§4.7.1): each registered endpoint gets its own
//! gRPC path, with a passthrough wire codec -- the Binary-IDL (or JSON)
//! codec already owns message semantics, so this transport only ever moves
//! opaque frames.

mod codec;
mod status;
mod worker_pool;

pub use codec::RawCodec;
pub use status::grpc_status_for;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use conduit_core::dispatch::{Outcome, RequestBytes};
use conduit_core::{CancelToken, Codec, Metadata, MetaValue, Path};
use conduit_registry::Router;
use conduit_transport::{LifecycleGuard, Transport, TransportError};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::server::{ClientStreamingService, ServerStreamingService, StreamingService, UnaryService};
use tonic::{Request as TonicRequest, Response as TonicResponse, Status};

use codec::RawCodec;
use status::grpc_status_for;
use worker_pool::WorkerPool;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcConfig {
    pub address: String,
    pub port: u16,
    pub max_message_size_kb: u32,
    pub error_details: bool,
    /// Size of the handler-invocation thread pool. `0` asks for one thread
    /// per CPU, `1` degrades to running handlers on the async runtime
    /// directly (no dedicated pool).
    pub max_workers: u32,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        GrpcConfig {
            address: "127.0.0.1".to_string(),
            port: 50051,
            max_message_size_kb: 4096,
            error_details: false,
            max_workers: 1,
        }
    }
}

struct Shared {
    router: Arc<Router>,
    codec: Arc<dyn Codec>,
    config: GrpcConfig,
    pool: Option<WorkerPool>,
}

pub struct GrpcTransport {
    shared: Arc<Shared>,
    lifecycle: LifecycleGuard,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl GrpcTransport {
    pub fn new(router: Arc<Router>, codec: Arc<dyn Codec>, config: GrpcConfig) -> Self {
        let pool = if config.max_workers == 1 {
            None
        } else {
            Some(WorkerPool::new(config.max_workers))
        };
        GrpcTransport {
            shared: Arc::new(Shared { router, codec, config, pool }),
            lifecycle: LifecycleGuard::new(),
            local_addr: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn build_router(shared: Arc<Shared>) -> axum::Router {
        axum::Router::new().route("/{*rest}", post(grpc_call)).with_state(shared)
    }
}

#[async_trait::async_trait]
impl Transport for GrpcTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let addr: SocketAddr = format!("{}:{}", self.shared.config.address, self.shared.config.port)
            .parse()
            .map_err(|err: std::net::AddrParseError| TransportError::Bind(err.to_string()))?;
        let listener = TcpListener::bind(addr).await.map_err(|err| TransportError::Bind(err.to_string()))?;
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
                tracing::error!(error = %err, "grpc transport server task exited with an error");
            }
        });

        self.lifecycle.mark_started();
        tracing::info!(%bound, "grpc transport started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.lifecycle.mark_stopped() {
            tracing::warn!("grpc transport stop() called without a prior start()");
            return;
        }
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        tracing::info!("grpc transport stopped");
    }
}

fn conduit_metadata(meta: &tonic::metadata::MetadataMap) -> Metadata {
    meta.iter()
        .filter_map(|entry| match entry {
            tonic::metadata::KeyAndValueRef::Ascii(key, value) => {
                let value = value.to_str().ok()?.to_string();
                Some((key.as_str().to_string(), MetaValue::Str(value)))
            }
            tonic::metadata::KeyAndValueRef::Binary(_, _) => None,
        })
        .collect()
}

async fn grpc_call(State(shared): State<Arc<Shared>>, req: http::Request<axum::body::Body>) -> Response {
    let path = Path::from(req.uri().path());
    let Some(endpoint) = shared.router.route(&path) else {
        let status = Status::not_found(format!("no endpoint registered for {path}"));
        return status.to_http().into_response();
    };

    let mut grpc = tonic::server::Grpc::new(RawCodec);
    let reply_schema = endpoint.reply_schema.clone();
    let cardinality = endpoint.cardinality;

    match (cardinality.request_is_stream(), cardinality.reply_is_stream()) {
        (false, false) => {
            let adapter = UnaryAdapter { shared: shared.clone(), endpoint, reply_schema };
            grpc.unary(adapter, req).await.into_response()
        }
        (false, true) => {
            let adapter = ServerStreamingAdapter { shared: shared.clone(), endpoint };
            grpc.server_streaming(adapter, req).await.into_response()
        }
        (true, false) => {
            let adapter = ClientStreamingAdapter { shared: shared.clone(), endpoint, reply_schema };
            grpc.client_streaming(adapter, req).await.into_response()
        }
        (true, true) => {
            let adapter = BidiStreamingAdapter { shared: shared.clone(), endpoint };
            grpc.streaming(adapter, req).await.into_response()
        }
    }
}

type BoxFut<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

#[derive(Clone)]
struct UnaryAdapter {
    shared: Arc<Shared>,
    endpoint: conduit_core::Endpoint,
    reply_schema: conduit_core::model::Schema,
}

impl UnaryService<Bytes> for UnaryAdapter {
    type Response = Bytes;
    type Future = BoxFut<Result<TonicResponse<Bytes>, Status>>;

    fn call(&mut self, request: TonicRequest<Bytes>) -> Self::Future {
        let shared = self.shared.clone();
        let endpoint = self.endpoint.clone();
        let reply_schema = self.reply_schema.clone();
        Box::pin(async move {
            let metadata = conduit_metadata(request.metadata());
            let bytes = request.into_inner();
            let outcome = run_unary(&shared, endpoint, RequestBytes::Unary(bytes), metadata).await;
            match outcome {
                Outcome::Unary(Ok(value)) => Ok(TonicResponse::new(shared.codec.encode(&value, &reply_schema))),
                Outcome::Unary(Err(err)) => Err(grpc_status_for(&err, shared.config.error_details)),
                Outcome::Streaming(_) => Err(Status::internal("unary endpoint produced a stream")),
            }
        })
    }
}

type ReplyStream = std::pin::Pin<Box<dyn futures_core::Stream<Item = Result<Bytes, Status>> + Send + 'static>>;

#[derive(Clone)]
struct ServerStreamingAdapter {
    shared: Arc<Shared>,
    endpoint: conduit_core::Endpoint,
}

impl ServerStreamingService<Bytes> for ServerStreamingAdapter {
    type Response = Bytes;
    type ResponseStream = ReplyStream;
    type Future = BoxFut<Result<TonicResponse<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: TonicRequest<Bytes>) -> Self::Future {
        let shared = self.shared.clone();
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            let metadata = conduit_metadata(request.metadata());
            let bytes = request.into_inner();
            let outcome = conduit_transport::dispatch_typed(
                &shared.router,
                shared.codec.clone(),
                &endpoint.path,
                RequestBytes::Unary(bytes),
                metadata,
                CancelToken::new(),
            )
            .await;
            match outcome {
                Outcome::Streaming(stream) => {
                    let mapped: ReplyStream = Box::pin(stream.map(Ok));
                    Ok(TonicResponse::new(mapped))
                }
                Outcome::Unary(Err(err)) => Err(grpc_status_for(&err, shared.config.error_details)),
                Outcome::Unary(Ok(_)) => Err(Status::internal("streaming endpoint produced a unary reply")),
            }
        })
    }
}

#[derive(Clone)]
struct ClientStreamingAdapter {
    shared: Arc<Shared>,
    endpoint: conduit_core::Endpoint,
    reply_schema: conduit_core::model::Schema,
}

impl ClientStreamingService<Bytes> for ClientStreamingAdapter {
    type Response = Bytes;
    type Future = BoxFut<Result<TonicResponse<Bytes>, Status>>;

    fn call(&mut self, request: TonicRequest<tonic::Streaming<Bytes>>) -> Self::Future {
        let shared = self.shared.clone();
        let endpoint = self.endpoint.clone();
        let reply_schema = self.reply_schema.clone();
        Box::pin(async move {
            let metadata = conduit_metadata(request.metadata());
            let items = request_stream_to_bytes(request.into_inner());
            let outcome = run_unary(&shared, endpoint, RequestBytes::Stream(items), metadata).await;
            match outcome {
                Outcome::Unary(Ok(value)) => Ok(TonicResponse::new(shared.codec.encode(&value, &reply_schema))),
                Outcome::Unary(Err(err)) => Err(grpc_status_for(&err, shared.config.error_details)),
                Outcome::Streaming(_) => Err(Status::internal("client-streaming endpoint produced a stream reply")),
            }
        })
    }
}

#[derive(Clone)]
struct BidiStreamingAdapter {
    shared: Arc<Shared>,
    endpoint: conduit_core::Endpoint,
}

impl StreamingService<Bytes> for BidiStreamingAdapter {
    type Response = Bytes;
    type ResponseStream = ReplyStream;
    type Future = BoxFut<Result<TonicResponse<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: TonicRequest<tonic::Streaming<Bytes>>) -> Self::Future {
        let shared = self.shared.clone();
        let endpoint = self.endpoint.clone();
        Box::pin(async move {
            let metadata = conduit_metadata(request.metadata());
            let items = request_stream_to_bytes(request.into_inner());
            let outcome = conduit_transport::dispatch_typed(
                &shared.router,
                shared.codec.clone(),
                &endpoint.path,
                RequestBytes::Stream(items),
                metadata,
                CancelToken::new(),
            )
            .await;
            match outcome {
                Outcome::Streaming(stream) => {
                    let mapped: ReplyStream = Box::pin(stream.map(Ok));
                    Ok(TonicResponse::new(mapped))
                }
                Outcome::Unary(Err(err)) => Err(grpc_status_for(&err, shared.config.error_details)),
                Outcome::Unary(Ok(_)) => Err(Status::internal("bidi-streaming endpoint produced a unary reply")),
            }
        })
    }
}

/// Drop a client-streaming request's frames that error at the gRPC
/// transport layer rather than trying to represent them in
/// `RequestBytes::Stream`, which only ever carries decoded-elsewhere bytes.
fn request_stream_to_bytes(
    stream: tonic::Streaming<Bytes>,
) -> conduit_core::endpoint::BoxStream<'static, Bytes> {
    Box::pin(stream.filter_map(|item| async move {
        match item {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(error = %err, "client stream frame error, dropping");
                None
            }
        }
    }))
}

/// Unary dispatch, optionally off-loaded to the handler-invocation thread
/// pool (§4.7.1's multiprocess option, approximated here with threads --
/// see DESIGN.md).
async fn run_unary(
    shared: &Shared,
    endpoint: conduit_core::Endpoint,
    request: RequestBytes,
    metadata: Metadata,
) -> Outcome {
    match &shared.pool {
        Some(pool) => pool.dispatch(endpoint, shared.codec.clone(), request, metadata).await,
        None => conduit_core::dispatch::run(Arc::new(endpoint), shared.codec.clone(), request, metadata, CancelToken::new()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_degrades_to_in_process() {
        let config = GrpcConfig::default();
        assert_eq!(config.max_workers, 1);
    }

    #[test]
    fn conduit_metadata_skips_binary_entries_and_keeps_ascii() {
        let mut map = tonic::metadata::MetadataMap::new();
        map.insert("x-trace-id", "abc123".parse().unwrap());
        let meta = conduit_metadata(&map);
        assert_eq!(meta.get("x-trace-id").and_then(|v| v.as_str()), Some("abc123"));
    }
}
