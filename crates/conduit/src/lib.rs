#![doc = include_str!("../README.md")]

//! The single crate most users of conduit RPC depend on directly: it
//! re-exports the core runtime (`conduit-core`), the built-in codecs
//! (`conduit-codec`), the endpoint router (`conduit-registry`), and the
//! derive/attribute macros (`conduit-macros`), then wires them up to
//! whichever of the four transports (§4.7) a caller enables via Cargo
//! features. `conduit-client`'s channels are re-exported the same way,
//! behind the `client` feature.
//!
//! Nothing here adds behavior of its own -- every item is a straight
//! re-export, so `conduit::Router`, `conduit::Model`, and `conduit::endpoint`
//! all name the exact same items their home crates do.

pub use conduit_core::cancel::CancelToken;
pub use conduit_core::dispatch::{got_request, DispatchOutcome, Outcome, RequestBytes, StreamState};
pub use conduit_core::{
    BoxFuture, BoxStream, Cardinality, Codec, ConduitOneof, DependencyScope, Endpoint, FieldSchema, Handler,
    HandlerArgs, LeanConstruct, LogicalType, MetaValue, Metadata, Model, OneofBranch, Path, Provider, ReplyOutput,
    RequestInput, RpcError, Schema, Timestamp, Value, ViolationSet, provider_fn, provider_generator,
};

pub use conduit_codec::{BadRequest, BinaryIdlCodec, JsonCodec, SchemaRegistry, Status, StatusCode as WireStatusCode};

pub use conduit_registry::Router;

pub use conduit_macros::{endpoint, ConduitOneof as DeriveConduitOneof, Model as DeriveModel};

pub use conduit_transport::{LifecycleGuard, Transport, TransportError};

/// The handful of items almost every endpoint implementation or call site
/// needs, gathered in one place so a service crate can `use conduit::prelude::*;`
/// instead of importing each piece separately.
pub mod prelude {
    pub use crate::{endpoint, Cardinality, Metadata, Model, Path, RpcError, Value};
    pub use conduit_macros::Model as DeriveModel;
}

/// Per-transport server wiring (§4.7), one module per transport, each
/// feature-gated behind the matching Cargo feature so a binary that only
/// ever serves gRPC doesn't pull in `socketioxide` or `tokio-tungstenite`.
pub mod transport {
    #[cfg(feature = "grpc")]
    pub mod grpc {
        pub use conduit_transport_grpc::{grpc_status_for, GrpcConfig, GrpcTransport, RawCodec};
    }

    #[cfg(feature = "http")]
    pub mod http {
        pub use conduit_transport_http::{HttpConfig, HttpTransport};
    }

    #[cfg(feature = "bus")]
    pub mod bus {
        pub use conduit_transport_bus::{BusConfig, BusTransport};
    }

    #[cfg(feature = "loopback")]
    pub mod loopback {
        pub use conduit_transport_loopback::LoopbackTransport;
    }
}

/// Client channels (§4.8), re-exported whole behind the `client` feature so
/// a caller who only wants to dial out doesn't need the server-side
/// transport crates at all.
#[cfg(feature = "client")]
pub mod client {
    pub use conduit_client::{BusChannel, BusChannelError, Channel, ClientError, GrpcChannel, HttpChannel, LoopbackChannel, ReplyStream};
}

#[cfg(all(test, feature = "loopback"))]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use conduit_core::dispatch::DispatchOutcome;
    use conduit_core::endpoint::{BoxFuture, Handler, HandlerArgs, ReplyOutput, RequestInput};
    use conduit_core::model::{Cardinality, FieldSchema, LogicalType, Schema, Value};
    use conduit_core::{Codec, Model, Path, RpcError};
    use conduit_registry::Router;

    use crate::transport::loopback::LoopbackTransport;

    #[derive(Debug, PartialEq)]
    struct Ping {
        message: String,
    }

    impl Model for Ping {
        fn schema() -> Schema {
            Schema::new("test.Ping", vec![FieldSchema { name: "message".into(), ty: LogicalType::String }])
        }

        fn construct(mut fields: BTreeMap<String, Value>) -> Result<Self, RpcError> {
            let message = match fields.remove("message") {
                Some(Value::String(s)) => s,
                _ => String::new(),
            };
            Ok(Ping { message })
        }

        fn project(&self) -> BTreeMap<String, Value> {
            let mut fields = BTreeMap::new();
            fields.insert("message".to_string(), Value::String(self.message.clone()));
            fields
        }
    }

    struct PingHandler;

    impl Handler for PingHandler {
        fn call(&self, args: HandlerArgs) -> BoxFuture<'static, Result<ReplyOutput, RpcError>> {
            Box::pin(async move {
                match args.request {
                    RequestInput::Unary(value) => Ok(ReplyOutput::Unary(value)),
                    RequestInput::Stream(_) => Err(RpcError::Internal),
                }
            })
        }
    }

    #[tokio_test_lite::test]
    async fn facade_reexports_reach_a_loopback_transport_end_to_end() {
        let router = Router::new();
        router.register(
            Path::from("/test.Ping/Call"),
            Cardinality::UnaryUnary,
            Ping::schema(),
            Ping::schema(),
            Arc::new(PingHandler),
            vec![],
            vec![],
        );
        let router = Arc::new(router);
        let codec: Arc<dyn conduit_core::Codec> =
            Arc::new(conduit_codec::JsonCodec::new(Arc::new(conduit_codec::SchemaRegistry::new())));
        let transport = LoopbackTransport::new(router, codec.clone());

        let request = Ping { message: "hi".to_string() };
        let bytes = codec.encode(&Value::Message(request.project()), &Ping::schema());
        let outcome = transport.call(&Path::from("/test.Ping/Call"), bytes).await;
        match outcome {
            DispatchOutcome::Unary(bytes) => {
                let decoded = codec.decode(&bytes, &Ping::schema()).unwrap();
                let Value::Message(fields) = decoded else { panic!("expected a message") };
                assert_eq!(Ping::construct(fields).unwrap(), Ping { message: "hi".to_string() });
            }
            DispatchOutcome::Streaming(_) => panic!("expected unary outcome"),
        }
    }
}
