//! Transport-independent core of the conduit RPC runtime: the canonical
//! error taxonomy (C1), the in-memory data model and `Model` contract (C2),
//! the dependency resolver (C5), and the dispatch engine (C6).
//!
//! Nothing in this crate knows about gRPC, HTTP, WebSockets, or any
//! particular wire codec -- those live in `conduit-codec` and the
//! `conduit-transport-*` crates, which depend on this one rather than the
//! other way around.

pub mod cancel;
pub mod codec;
pub mod dependency;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod metadata;
pub mod model;
pub mod path;

pub use cancel::CancelToken;
pub use codec::Codec;
pub use dependency::{provider_fn, provider_generator, DependencyScope, Provider};
pub use dispatch::{got_request, DispatchOutcome, Outcome, RequestBytes, StreamState};
pub use endpoint::{BoxFuture, BoxStream, Endpoint, Handler, HandlerArgs, ReplyOutput, RequestInput};
pub use error::{RpcError, ViolationSet};
pub use metadata::{MetaValue, Metadata};
pub use model::{
    Cardinality, ConduitOneof, FieldSchema, LeanConstruct, LogicalType, Model, OneofBranch, Schema, Timestamp, Value,
};
pub use path::Path;
