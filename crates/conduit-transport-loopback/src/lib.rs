//! In-process loopback transport (§4.7.4): a direct function call, no
//! framing, no metadata by default. The simplest of the four mandated
//! adapters, and the one the cross-transport parity property (§8,
//! invariant 7) uses as its reference.

use std::sync::Arc;

use bytes::Bytes;
use conduit_core::dispatch::{DispatchOutcome, RequestBytes};
use conduit_core::{CancelToken, Codec, Metadata, Path};
use conduit_registry::Router;
use conduit_transport::{dispatch, LifecycleGuard, Transport, TransportError};

pub struct LoopbackTransport {
    router: Arc<Router>,
    codec: Arc<dyn Codec>,
    lifecycle: LifecycleGuard,
}

impl LoopbackTransport {
    pub fn new(router: Arc<Router>, codec: Arc<dyn Codec>) -> Self {
        LoopbackTransport {
            router,
            codec,
            lifecycle: LifecycleGuard::new(),
        }
    }

    /// Hand `(path, bytes)` straight to the dispatch engine (§4.7.4): no
    /// framing, no metadata, no cancellation.
    pub async fn call(&self, path: &Path, bytes: Bytes) -> DispatchOutcome {
        self.call_with(path, RequestBytes::Unary(bytes), Metadata::new(), CancelToken::new())
            .await
    }

    /// The same call, but exposing metadata and cancellation for callers
    /// that exercise the loopback transport as the reference implementation
    /// in cross-transport parity tests.
    pub async fn call_with(
        &self,
        path: &Path,
        request: RequestBytes,
        metadata: Metadata,
        cancel: CancelToken,
    ) -> DispatchOutcome {
        dispatch(&self.router, self.codec.clone(), path, request, metadata, cancel).await
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.lifecycle.mark_started();
        tracing::trace!("loopback transport started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.lifecycle.mark_stopped() {
            tracing::warn!("loopback transport stop() called without a prior start()");
        }
        tracing::trace!("loopback transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::endpoint::{BoxFuture, Endpoint, Handler, HandlerArgs, ReplyOutput, RequestInput};
    use conduit_core::model::{Cardinality, LogicalType, Schema, Value};
    use conduit_core::RpcError;

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
            "echo-test"
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
            vec![conduit_core::model::FieldSchema {
                name: "value".into(),
                ty: LogicalType::String,
            }],
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

    #[tokio_test_lite::test]
    async fn call_dispatches_to_registered_endpoint() {
        let transport = LoopbackTransport::new(test_router(), Arc::new(EchoCodec));
        transport.start().await.unwrap();

        let outcome = transport.call(&Path::from("/test.Echo/Call"), Bytes::from_static(b"hello")).await;
        match outcome {
            DispatchOutcome::Unary(bytes) => assert_eq!(&bytes[..], b"hello"),
            DispatchOutcome::Streaming(_) => panic!("expected unary outcome"),
        }
    }

    #[tokio_test_lite::test]
    async fn unmapped_path_becomes_not_found() {
        let transport = LoopbackTransport::new(test_router(), Arc::new(EchoCodec));
        let outcome = transport.call(&Path::from("/test.Echo/Missing"), Bytes::new()).await;
        match outcome {
            DispatchOutcome::Unary(bytes) => assert_eq!(&bytes[..], b"error:not_found"),
            DispatchOutcome::Streaming(_) => panic!("expected unary outcome"),
        }
    }

    #[tokio_test_lite::test]
    async fn stop_without_start_warns_and_is_a_no_op() {
        let transport = LoopbackTransport::new(test_router(), Arc::new(EchoCodec));
        transport.stop().await;
        let outcome = transport.call(&Path::from("/test.Echo/Call"), Bytes::from_static(b"hi")).await;
        match outcome {
            DispatchOutcome::Unary(bytes) => assert_eq!(&bytes[..], b"hi"),
            DispatchOutcome::Streaming(_) => panic!("expected unary outcome"),
        }
    }
}
