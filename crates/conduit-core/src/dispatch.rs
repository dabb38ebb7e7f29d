//! The dispatch engine (C6): the single cardinality-aware pipeline every
//! transport adapter drives. `got_request` is the one entry point; it never
//! returns a Rust `Err` because every failure -- decode, missing metadata,
//! dependency acquisition, handler panic -- is already rendered to bytes by
//! the time it returns, so transports only ever have bytes (or a stream of
//! them) to write to the wire.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::StreamExt;

use crate::cancel::CancelToken;
use crate::codec::Codec;
use crate::dependency::DependencyScope;
use crate::endpoint::{BoxStream, Endpoint, HandlerArgs, ReplyOutput, RequestInput};
use crate::error::RpcError;
use crate::metadata::Metadata;

/// Request-side bytes handed to the engine by a transport.
pub enum RequestBytes {
    /// UU / US: one request frame.
    Unary(Bytes),
    /// SU / SS: an ordered sequence of request frames.
    Stream(BoxStream<'static, Bytes>),
}

/// Reply-side bytes handed back to a transport.
pub enum DispatchOutcome {
    /// UU / SU, or any cardinality's early failure (decode error, missing
    /// metadata, dependency failure): one frame.
    Unary(Bytes),
    /// US / SS: a lazy sequence of frames, terminated exactly once per the
    /// state machine below.
    Streaming(BoxStream<'static, Bytes>),
}

/// Observable state of one streaming reply (§4.6). Exposed for transports
/// that want to assert `Terminated` was reached exactly once (the loopback
/// transport's tests do; see `conduit-transport-loopback`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Producing,
    Terminated,
}

fn decode_stream(
    codec: Arc<dyn Codec>,
    schema: crate::model::Schema,
    chunks: BoxStream<'static, Bytes>,
) -> BoxStream<'static, Result<crate::model::Value, RpcError>> {
    Box::pin(chunks.map(move |bytes| codec.decode(&bytes, &schema)))
}

/// Build the request-side input the handler will see, given raw bytes from
/// the transport. Unary decode failure is reported by returning `Err`
/// directly (step 1 of §4.6): the scope never opens and the handler never
/// runs.
async fn build_request_input(
    codec: &Arc<dyn Codec>,
    endpoint: &Endpoint,
    bytes: RequestBytes,
) -> Result<RequestInput, RpcError> {
    match bytes {
        RequestBytes::Unary(b) => codec
            .decode(&b, &endpoint.request_schema)
            .map(RequestInput::Unary),
        RequestBytes::Stream(chunks) => Ok(RequestInput::Stream(decode_stream(
            codec.clone(),
            endpoint.request_schema.clone(),
            chunks,
        ))),
    }
}

/// Look up every declared meta-parameter in `metadata`, in declaration
/// order. A missing key is `InvalidArgument` (step 3 of §4.6).
fn resolve_meta(
    endpoint: &Endpoint,
    metadata: &Metadata,
) -> Result<Vec<(String, crate::metadata::MetaValue)>, RpcError> {
    let mut resolved = Vec::with_capacity(endpoint.meta_keys.len());
    for key in &endpoint.meta_keys {
        match metadata.get(key) {
            Some(value) => resolved.push((key.clone(), value.clone())),
            None => {
                return Err(RpcError::invalid_field(
                    key.clone(),
                    "missing required metadata",
                ));
            }
        }
    }
    Ok(resolved)
}

/// Result of running one request through the pipeline, before any
/// transport-specific encoding. Kept distinct from [`DispatchOutcome`] so
/// transports with their own status channel -- gRPC status codes, HTTP
/// status codes, event-bus ack tuples -- can map the originating
/// [`RpcError`] directly instead of round-tripping through encoded bytes.
/// Streaming replies have no separate error channel (§9 open question 2):
/// a streaming handler's failure is folded into the byte stream exactly the
/// way [`got_request`] already does, so `Outcome::Streaming` carries the
/// same already-encoded `BoxStream<Bytes>` either way.
pub enum Outcome {
    Unary(Result<crate::model::Value, RpcError>),
    Streaming(BoxStream<'static, Bytes>),
}

/// Run one request through the full pipeline -- decode, scope, dependency
/// resolution, handler invocation -- stopping short of encoding the unary
/// result, so callers can inspect the originating error. [`got_request`] is
/// the bytes-only convenience wrapper most transports use; this is for the
/// few that need the typed error too (see [`Outcome`]).
pub async fn run(
    endpoint: Arc<Endpoint>,
    codec: Arc<dyn Codec>,
    request: RequestBytes,
    metadata: Metadata,
    cancel: CancelToken,
) -> Outcome {
    let request_input = match build_request_input(&codec, &endpoint, request).await {
        Ok(input) => input,
        Err(err) => {
            tracing::warn!(path = %endpoint.path, error = %err, "request decode failed");
            return Outcome::Unary(Err(err));
        }
    };

    let meta = match resolve_meta(&endpoint, &metadata) {
        Ok(meta) => meta,
        Err(err) => return Outcome::Unary(Err(err)),
    };

    let deps = match DependencyScope::resolve(&endpoint.deps).await {
        Ok(deps) => deps,
        Err(err) => {
            tracing::warn!(path = %endpoint.path, error = %err, "dependency resolution failed");
            return Outcome::Unary(Err(err));
        }
    };

    let release_deps = deps.clone();
    let args = HandlerArgs {
        request: request_input,
        meta,
        deps,
    };

    if endpoint.cardinality.reply_is_stream() {
        Outcome::Streaming(dispatch_streaming(endpoint, codec, args, release_deps, cancel))
    } else {
        Outcome::Unary(run_unary_handler(endpoint, args, release_deps).await)
    }
}

/// Run one request through the full pipeline: decode, scope, dependency
/// resolution, handler invocation, and reply encoding, for every
/// cardinality uniformly.
pub async fn got_request(
    endpoint: Arc<Endpoint>,
    codec: Arc<dyn Codec>,
    request: RequestBytes,
    metadata: Metadata,
    cancel: CancelToken,
) -> DispatchOutcome {
    let reply_schema = endpoint.reply_schema.clone();
    match run(endpoint, codec.clone(), request, metadata, cancel).await {
        Outcome::Unary(Ok(value)) => DispatchOutcome::Unary(codec.encode(&value, &reply_schema)),
        Outcome::Unary(Err(err)) => DispatchOutcome::Unary(codec.encode_error(&err)),
        Outcome::Streaming(stream) => DispatchOutcome::Streaming(stream),
    }
}

/// UU / SU: await one reply value, release dependencies. Stops short of
/// encoding so both `run` (typed) and the streaming path's "handler failed
/// before the first yield" branch can share this.
async fn run_unary_handler(
    endpoint: Arc<Endpoint>,
    args: HandlerArgs,
    deps: DependencyScope,
) -> Result<crate::model::Value, RpcError> {
    let handler = endpoint.handler.clone();
    let path = endpoint.path.clone();

    let outcome = AssertUnwindSafe(handler.call(args)).catch_unwind().await;
    deps.release().await;

    match outcome {
        Ok(Ok(ReplyOutput::Unary(value))) => Ok(value),
        Ok(Ok(ReplyOutput::Stream(_))) => {
            tracing::error!(path = %path, "unary endpoint handler returned a stream");
            Err(RpcError::uncaught())
        }
        Ok(Err(err)) => Err(err),
        Err(panic) => {
            log_handler_panic(&path, panic);
            Err(RpcError::uncaught())
        }
    }
}

/// US / SS: drive the handler's lazy sequence item-by-item, honoring
/// cancellation, and release dependencies exactly once when the stream
/// reaches `Terminated` (final yield, handler error, or cancellation).
fn dispatch_streaming(
    endpoint: Arc<Endpoint>,
    codec: Arc<dyn Codec>,
    args: HandlerArgs,
    deps: DependencyScope,
    cancel: CancelToken,
) -> DispatchOutcome {
    let handler = endpoint.handler.clone();
    let reply_schema = endpoint.reply_schema.clone();
    let path = endpoint.path.clone();

    let stream = async_stream::stream! {
        let outcome = AssertUnwindSafe(handler.call(args)).catch_unwind().await;
        let items: BoxStream<'static, Result<crate::model::Value, RpcError>> = match outcome {
            Ok(Ok(ReplyOutput::Stream(items))) => items,
            Ok(Ok(ReplyOutput::Unary(value))) => {
                Box::pin(futures_util::stream::once(futures_util::future::ready(Ok(value))))
            }
            Ok(Err(err)) => {
                tracing::warn!(path = %path, error = %err, "streaming handler returned an error before yielding");
                deps.release().await;
                yield codec.encode_error(&err);
                return;
            }
            Err(panic) => {
                log_handler_panic(&path, panic);
                deps.release().await;
                yield codec.encode_error(&RpcError::uncaught());
                return;
            }
        };

        tokio::pin!(items);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::trace!(path = %path, "stream cancelled by transport");
                    break;
                }
                next = items.next() => next,
            };

            match next {
                Some(Ok(value)) => yield codec.encode(&value, &reply_schema),
                Some(Err(err)) => {
                    tracing::warn!(path = %path, error = %err, "streaming handler error mid-flight");
                    break;
                }
                None => break,
            }
        }

        deps.release().await;
    };

    DispatchOutcome::Streaming(Box::pin(stream))
}

fn log_handler_panic(path: &crate::path::Path, panic: Box<dyn std::any::Any + Send>) {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    tracing::error!(path = %path, panic = %message, "handler panicked; replying with ServerError");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{BoxFuture, Endpoint, Handler};
    use crate::model::{Cardinality, LogicalType, Schema, Value};
    use crate::path::Path;
    use std::collections::BTreeMap;

    struct EchoCodec;

    impl Codec for EchoCodec {
        fn decode(&self, bytes: &[u8], _schema: &Schema) -> Result<Value, RpcError> {
            if bytes.is_empty() {
                return Ok(Value::String(String::new()));
            }
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

    fn test_schema() -> Schema {
        Schema::new(
            "test.Echo",
            vec![crate::model::FieldSchema {
                name: "value".into(),
                ty: LogicalType::String,
            }],
        )
    }

    fn echo_endpoint() -> Arc<Endpoint> {
        Arc::new(Endpoint::new(
            Path::from("/test.Echo/Call"),
            Cardinality::UnaryUnary,
            test_schema(),
            test_schema(),
            Arc::new(EchoHandler),
        ))
    }

    #[tokio_test_lite::test]
    async fn unary_roundtrips_through_codec() {
        let endpoint = echo_endpoint();
        let codec: Arc<dyn Codec> = Arc::new(EchoCodec);
        let outcome = got_request(
            endpoint,
            codec,
            RequestBytes::Unary(Bytes::from_static(b"hello")),
            Metadata::new(),
            CancelToken::new(),
        )
        .await;

        match outcome {
            DispatchOutcome::Unary(bytes) => assert_eq!(&bytes[..], b"hello"),
            DispatchOutcome::Streaming(_) => panic!("expected unary outcome"),
        }
    }

    #[tokio_test_lite::test]
    async fn missing_metadata_short_circuits_before_handler_runs() {
        let mut endpoint = Endpoint::new(
            Path::from("/test.Echo/Call"),
            Cardinality::UnaryUnary,
            test_schema(),
            test_schema(),
            Arc::new(EchoHandler),
        );
        endpoint.meta_keys = vec!["connection-id".into()];
        let codec: Arc<dyn Codec> = Arc::new(EchoCodec);

        let outcome = got_request(
            Arc::new(endpoint),
            codec,
            RequestBytes::Unary(Bytes::from_static(b"hello")),
            Metadata::new(),
            CancelToken::new(),
        )
        .await;

        match outcome {
            DispatchOutcome::Unary(bytes) => {
                assert_eq!(&bytes[..], b"error:invalid_argument");
            }
            DispatchOutcome::Streaming(_) => panic!("expected unary outcome"),
        }
    }

    #[tokio_test_lite::test]
    async fn streaming_endpoint_emits_every_item_then_terminates() {
        struct ThreeItems;
        impl Handler for ThreeItems {
            fn call(
                &self,
                _args: HandlerArgs,
            ) -> BoxFuture<'static, Result<ReplyOutput, RpcError>> {
                Box::pin(async move {
                    let items = futures_util::stream::iter(
                        ["0", "1", "2"]
                            .into_iter()
                            .map(|s| Ok(Value::String(s.to_string()))),
                    );
                    Ok(ReplyOutput::Stream(Box::pin(items)))
                })
            }
        }

        let endpoint = Arc::new(Endpoint::new(
            Path::from("/test.Echo/Stream"),
            Cardinality::UnaryStream,
            test_schema(),
            test_schema(),
            Arc::new(ThreeItems),
        ));
        let codec: Arc<dyn Codec> = Arc::new(EchoCodec);

        let outcome = got_request(
            endpoint,
            codec,
            RequestBytes::Unary(Bytes::new()),
            Metadata::new(),
            CancelToken::new(),
        )
        .await;

        match outcome {
            DispatchOutcome::Streaming(stream) => {
                let items: Vec<Bytes> = stream.collect().await;
                assert_eq!(items, vec![Bytes::from_static(b"0"), Bytes::from_static(b"1"), Bytes::from_static(b"2")]);
            }
            DispatchOutcome::Unary(_) => panic!("expected streaming outcome"),
        }
    }

    #[tokio_test_lite::test]
    async fn handler_panic_becomes_server_error() {
        struct Boom;
        impl Handler for Boom {
            fn call(
                &self,
                _args: HandlerArgs,
            ) -> BoxFuture<'static, Result<ReplyOutput, RpcError>> {
                Box::pin(async move { panic!("kaboom") })
            }
        }

        let endpoint = Arc::new(Endpoint::new(
            Path::from("/test.Echo/Boom"),
            Cardinality::UnaryUnary,
            test_schema(),
            test_schema(),
            Arc::new(Boom),
        ));
        let codec: Arc<dyn Codec> = Arc::new(EchoCodec);

        let outcome = got_request(
            endpoint,
            codec,
            RequestBytes::Unary(Bytes::new()),
            Metadata::new(),
            CancelToken::new(),
        )
        .await;

        match outcome {
            DispatchOutcome::Unary(bytes) => assert_eq!(&bytes[..], b"error:server_error"),
            DispatchOutcome::Streaming(_) => panic!("expected unary outcome"),
        }
        let _ = BTreeMap::<String, String>::new();
    }
}
