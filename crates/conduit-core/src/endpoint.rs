//! The endpoint descriptor (C4's unit of registration) and the handler
//! contract the dispatch engine invokes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;

use crate::dependency::{DependencyScope, Provider};
use crate::error::RpcError;
use crate::metadata::MetaValue;
use crate::model::{Cardinality, Schema, Value};
use crate::path::Path;

pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a handler receives once the request side of the pipeline has been
/// decoded and the cardinality-appropriate shape assembled.
pub enum RequestInput {
    /// UU / US: one decoded request value.
    Unary(Value),
    /// SU / SS: an ordered, possibly-infinite sequence of decoded request
    /// values. Decode failures on individual chunks surface as stream items.
    Stream(BoxStream<'static, Result<Value, RpcError>>),
}

/// What a handler produces; the dispatch engine encodes each according to
/// the endpoint's cardinality.
pub enum ReplyOutput {
    /// UU / SU: one reply value.
    Unary(Value),
    /// US / SS: a lazy sequence of reply values, driven by the engine one
    /// item at a time (§4.6 state machine).
    Stream(BoxStream<'static, Result<Value, RpcError>>),
}

/// Everything a handler needs for one request: the decoded request, the
/// values resolved for its declared meta-parameters (in declaration order,
/// already looked up and type-checked against metadata), and the resolved
/// dependency scope.
pub struct HandlerArgs {
    pub request: RequestInput,
    pub meta: Vec<(String, MetaValue)>,
    pub deps: DependencyScope,
}

/// The handler contract every registered endpoint implements. Applications
/// normally reach this through a typed wrapper generated by
/// `#[conduit::endpoint]`, not by implementing it directly.
pub trait Handler: Send + Sync {
    fn call(&self, args: HandlerArgs) -> BoxFuture<'static, Result<ReplyOutput, RpcError>>;
}

impl<F> Handler for F
where
    F: Fn(HandlerArgs) -> BoxFuture<'static, Result<ReplyOutput, RpcError>> + Send + Sync,
{
    fn call(&self, args: HandlerArgs) -> BoxFuture<'static, Result<ReplyOutput, RpcError>> {
        (self)(args)
    }
}

/// A named entity identified by its [`Path`], per §3: path, cardinality,
/// request/reply schemas, handler, meta-parameter names, and dependency
/// bindings, all supplied explicitly at registration time (Design Note, §9
/// -- Rust has no runtime signature introspection to recover them from).
#[derive(Clone)]
pub struct Endpoint {
    pub path: Path,
    pub cardinality: Cardinality,
    pub request_schema: Schema,
    pub reply_schema: Schema,
    pub meta_keys: Vec<String>,
    pub deps: Vec<Arc<dyn Provider>>,
    pub handler: Arc<dyn Handler>,
}

impl Endpoint {
    pub fn new(
        path: Path,
        cardinality: Cardinality,
        request_schema: Schema,
        reply_schema: Schema,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Endpoint {
            path,
            cardinality,
            request_schema,
            reply_schema,
            meta_keys: Vec::new(),
            deps: Vec::new(),
            handler,
        }
    }

    pub fn with_meta_keys(mut self, meta_keys: Vec<String>) -> Self {
        self.meta_keys = meta_keys;
        self
    }

    pub fn with_deps(mut self, deps: Vec<Arc<dyn Provider>>) -> Self {
        self.deps = deps;
        self
    }
}
