//! Client channels (C8): one implementation per transport mandated by §4.7,
//! all exposing the same call shape (§4.8). An application picks whichever
//! channel matches the server it's talking to; the typed request/reply
//! model and the dispatch semantics it observes are identical either way
//! (§8 invariant 7 is what this crate's conformance tests hold every
//! channel to).
//!
//! Every method is generic over `Req`/`Rep: Model` rather than over a
//! schema-erased `Value`, so callers write against the same typed request
//! and reply structs `#[conduit::endpoint]` handlers do. Encoding and
//! decoding go through whichever [`Codec`](conduit_core::Codec) the channel
//! was built with, exactly as a transport adapter's own codec does.

mod bus;
mod error;
mod grpc;
mod http;
mod loopback;
mod model_codec;
mod stream;

pub use bus::{BusChannel, BusChannelError};
pub use error::ClientError;
pub use grpc::GrpcChannel;
pub use http::HttpChannel;
pub use loopback::LoopbackChannel;
pub use stream::ReplyStream;

use std::future::Future;
use std::time::Duration;

use conduit_core::{BoxStream, Metadata, Model, Path};

/// The four call shapes §4.8 mandates, implemented identically in spirit by
/// every channel in this crate. `timeout` (client-side only, per §5 -- "only
/// client-side timeout is honored") is accepted by every method but only
/// `unary_unary` plumbs it through on the channels built on a request/reply
/// primitive their transport natively supports (gRPC, HTTP); channels that
/// have no wire notion of a deadline (loopback, the event-bus) accept and
/// ignore it.
///
/// Generic over `Req`/`Rep` per call rather than per-channel, so a single
/// channel instance serves every endpoint's distinct request/reply types --
/// this is why the methods return `impl Future` (native async-fn-in-trait)
/// instead of going through `#[async_trait]`: a boxed trait object could
/// never be generic over the caller's `Req`/`Rep`.
pub trait Channel {
    /// UU: one request, one reply.
    fn unary_unary<Req, Rep>(
        &self,
        path: &Path,
        request: Req,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Rep, ClientError>> + Send
    where
        Req: Model + Send,
        Rep: Model + Send;

    /// US: one request, a lazy sequence of replies.
    fn unary_stream<Req, Rep>(
        &self,
        path: &Path,
        request: Req,
        metadata: Metadata,
    ) -> impl Future<Output = Result<ReplyStream<Rep>, ClientError>> + Send
    where
        Req: Model + Send,
        Rep: Model + Send + 'static;

    /// SU: a sequence of requests, one reply.
    fn stream_unary<Req, Rep>(
        &self,
        path: &Path,
        requests: BoxStream<'static, Req>,
        metadata: Metadata,
    ) -> impl Future<Output = Result<Rep, ClientError>> + Send
    where
        Req: Model + Send + 'static,
        Rep: Model + Send;

    /// SS: a sequence of requests, a lazy sequence of replies.
    fn stream_stream<Req, Rep>(
        &self,
        path: &Path,
        requests: BoxStream<'static, Req>,
        metadata: Metadata,
    ) -> impl Future<Output = Result<ReplyStream<Rep>, ClientError>> + Send
    where
        Req: Model + Send + 'static,
        Rep: Model + Send + 'static;
}
