//! The in-process loopback channel (§4.7.4's client side): hands typed
//! requests straight to the dispatch engine through the same
//! [`conduit_registry::Router`] a `LoopbackTransport` would serve, with no
//! framing and no network hop. The reference channel cross-transport
//! parity tests (§8 invariant 7) compare every other channel against.

use std::sync::Arc;

use conduit_core::dispatch::{Outcome, RequestBytes};
use conduit_core::{BoxStream, CancelToken, Codec, Metadata, Model, Path, RpcError};
use conduit_registry::Router;
use futures_util::StreamExt;

use crate::model_codec::{decode_reply, encode_request};
use crate::stream::ReplyStream;
use crate::{Channel, ClientError};

pub struct LoopbackChannel {
    router: Arc<Router>,
    codec: Arc<dyn Codec>,
}

impl LoopbackChannel {
    pub fn new(router: Arc<Router>, codec: Arc<dyn Codec>) -> Self {
        LoopbackChannel { router, codec }
    }
}

impl Channel for LoopbackChannel {
    async fn unary_unary<Req, Rep>(
        &self,
        path: &Path,
        request: Req,
        metadata: Metadata,
        _timeout: Option<std::time::Duration>,
    ) -> Result<Rep, ClientError>
    where
        Req: Model + Send,
        Rep: Model + Send,
    {
        let bytes = encode_request(self.codec.as_ref(), &request);
        match conduit_transport::dispatch_typed(
            &self.router,
            self.codec.clone(),
            path,
            RequestBytes::Unary(bytes),
            metadata,
            CancelToken::new(),
        )
        .await
        {
            Outcome::Unary(Ok(value)) => {
                let fields = match value {
                    conduit_core::Value::Message(fields) => fields,
                    _ => Default::default(),
                };
                Rep::construct(fields).map_err(ClientError::from)
            }
            Outcome::Unary(Err(err)) => Err(ClientError::from(err)),
            Outcome::Streaming(_) => Err(ClientError::from(RpcError::Internal)),
        }
    }

    async fn unary_stream<Req, Rep>(
        &self,
        path: &Path,
        request: Req,
        metadata: Metadata,
    ) -> Result<ReplyStream<Rep>, ClientError>
    where
        Req: Model + Send,
        Rep: Model + Send + 'static,
    {
        let bytes = encode_request(self.codec.as_ref(), &request);
        self.dispatch_stream(path, RequestBytes::Unary(bytes), metadata).await
    }

    async fn stream_unary<Req, Rep>(
        &self,
        path: &Path,
        requests: BoxStream<'static, Req>,
        metadata: Metadata,
    ) -> Result<Rep, ClientError>
    where
        Req: Model + Send + 'static,
        Rep: Model + Send,
    {
        let codec = self.codec.clone();
        let bytes_stream = requests.map(move |req| encode_request(codec.as_ref(), &req));
        match conduit_transport::dispatch_typed(
            &self.router,
            self.codec.clone(),
            path,
            RequestBytes::Stream(Box::pin(bytes_stream)),
            metadata,
            CancelToken::new(),
        )
        .await
        {
            Outcome::Unary(Ok(value)) => {
                let fields = match value {
                    conduit_core::Value::Message(fields) => fields,
                    _ => Default::default(),
                };
                Rep::construct(fields).map_err(ClientError::from)
            }
            Outcome::Unary(Err(err)) => Err(ClientError::from(err)),
            Outcome::Streaming(_) => Err(ClientError::from(RpcError::Internal)),
        }
    }

    async fn stream_stream<Req, Rep>(
        &self,
        path: &Path,
        requests: BoxStream<'static, Req>,
        metadata: Metadata,
    ) -> Result<ReplyStream<Rep>, ClientError>
    where
        Req: Model + Send + 'static,
        Rep: Model + Send + 'static,
    {
        let codec = self.codec.clone();
        let bytes_stream = requests.map(move |req| encode_request(codec.as_ref(), &req));
        self.dispatch_stream(path, RequestBytes::Stream(Box::pin(bytes_stream)), metadata).await
    }
}

impl LoopbackChannel {
    async fn dispatch_stream<Rep: Model + Send + 'static>(
        &self,
        path: &Path,
        request: RequestBytes,
        metadata: Metadata,
    ) -> Result<ReplyStream<Rep>, ClientError> {
        let outcome = conduit_transport::dispatch_typed(
            &self.router,
            self.codec.clone(),
            path,
            request,
            metadata,
            CancelToken::new(),
        )
        .await;

        match outcome {
            Outcome::Streaming(bytes) => {
                let codec = self.codec.clone();
                let items = bytes.map(move |frame| decode_reply::<Rep>(codec.as_ref(), &frame));
                Ok(ReplyStream::without_end_signal(Box::pin(items)))
            }
            Outcome::Unary(Err(err)) => Err(ClientError::from(err)),
            Outcome::Unary(Ok(_)) => Err(ClientError::from(RpcError::Internal)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::endpoint::{BoxFuture, Endpoint, Handler, HandlerArgs, ReplyOutput, RequestInput};
    use conduit_core::model::{Cardinality, FieldSchema, LogicalType, Schema, Value};
    use std::collections::BTreeMap;

    struct EchoCodec;

    impl Codec for EchoCodec {
        fn decode(&self, bytes: &[u8], schema: &Schema) -> Result<Value, RpcError> {
            let text = String::from_utf8_lossy(bytes).into_owned();
            let mut fields = BTreeMap::new();
            fields.insert("value".to_string(), Value::String(text));
            let _ = schema;
            Ok(Value::Message(fields))
        }

        fn encode(&self, value: &Value, _schema: &Schema) -> bytes::Bytes {
            match value {
                Value::Message(fields) => match fields.get("value") {
                    Some(Value::String(s)) => bytes::Bytes::from(s.clone().into_bytes()),
                    _ => bytes::Bytes::new(),
                },
                _ => bytes::Bytes::new(),
            }
        }

        fn encode_error(&self, err: &RpcError) -> bytes::Bytes {
            bytes::Bytes::from(format!("error:{}", err.kind_name()))
        }

        fn name(&self) -> &'static str {
            "echo-test"
        }
    }

    #[derive(Debug, PartialEq)]
    struct Echo {
        value: String,
    }

    impl Model for Echo {
        fn schema() -> Schema {
            Schema::new("test.Echo", vec![FieldSchema { name: "value".into(), ty: LogicalType::String }])
        }

        fn construct(mut fields: BTreeMap<String, Value>) -> Result<Self, RpcError> {
            let value = match fields.remove("value") {
                Some(Value::String(s)) => s,
                _ => String::new(),
            };
            Ok(Echo { value })
        }

        fn project(&self) -> BTreeMap<String, Value> {
            let mut out = BTreeMap::new();
            out.insert("value".to_string(), Value::String(self.value.clone()));
            out
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

    fn test_router() -> Arc<Router> {
        let router = Router::new();
        router.register(
            Path::from("/test.Echo/Call"),
            Cardinality::UnaryUnary,
            Echo::schema(),
            Echo::schema(),
            Arc::new(EchoHandler),
            vec![],
            vec![],
        );
        Arc::new(router)
    }

    #[tokio_test_lite::test]
    async fn unary_unary_round_trips_through_a_typed_model() {
        let channel = LoopbackChannel::new(test_router(), Arc::new(EchoCodec));
        let reply: Echo = channel
            .unary_unary(
                &Path::from("/test.Echo/Call"),
                Echo { value: "hello".to_string() },
                Metadata::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(reply.value, "hello");
    }

    #[tokio_test_lite::test]
    async fn unary_unary_surfaces_not_found_as_an_rpc_error() {
        let channel = LoopbackChannel::new(test_router(), Arc::new(EchoCodec));
        let err = channel
            .unary_unary::<Echo, Echo>(
                &Path::from("/test.Echo/Missing"),
                Echo { value: "hi".to_string() },
                Metadata::new(),
                None,
            )
            .await
            .unwrap_err();
        match err {
            ClientError::Rpc(RpcError::NotFound) => {}
            other => panic!("expected RpcError::NotFound, got {other:?}"),
        }
    }
}
