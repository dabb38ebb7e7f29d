//! The client-side counterpart of a streaming reply (§4.8): a lazy,
//! cancellable sequence of decoded values with an explicit `end()` that
//! sends the transport's own termination signal, not just a local drop.

use std::pin::Pin;
use std::task::{Context, Poll};

use conduit_core::RpcError;
use futures_core::Stream;

type Items<T> = Pin<Box<dyn Stream<Item = Result<T, RpcError>> + Send>>;

/// Closure run once by [`Stream::end`]. Boxed so each channel can plug in
/// whatever "tell the server to stop" mechanism its wire protocol uses:
/// a WebSocket `{"streamId":..,"end":true}` frame, a gRPC streaming-response
/// drop, a bus `cancel` with no wire counterpart at all.
type EndSignal = Box<dyn FnOnce() + Send>;

/// A lazy sequence of decoded reply values (§4.8, §3 invariant 4). Items
/// arrive in the order the handler produced them; iterate with
/// [`futures_util::StreamExt::next`] (this type implements [`Stream`]) or
/// the inherent [`ReplyStream::next`] convenience method.
pub struct ReplyStream<T> {
    items: Items<T>,
    end: Option<EndSignal>,
}

impl<T> ReplyStream<T> {
    pub fn new(items: Items<T>, end: EndSignal) -> Self {
        ReplyStream {
            items,
            end: Some(end),
        }
    }

    /// A stream with no explicit termination signal -- dropping it is the
    /// only way to stop early (the loopback and gRPC channels: dropping the
    /// underlying future/response stream already tears down the request).
    pub fn without_end_signal(items: Items<T>) -> Self {
        ReplyStream {
            items,
            end: Some(Box::new(|| {})),
        }
    }

    /// Pull the next item, if any. Returns `None` once the sequence has
    /// terminated (naturally, by error, or after [`ReplyStream::end`]).
    pub async fn next(&mut self) -> Option<Result<T, RpcError>> {
        futures_util::StreamExt::next(self).await
    }

    /// Send this stream's termination signal. Idempotent: calling it twice
    /// only sends the signal once. The stream itself keeps yielding
    /// whatever the server already had in flight; it terminates once the
    /// server observes the signal and closes its side.
    pub fn end(&mut self) {
        if let Some(end) = self.end.take() {
            end();
        }
    }
}

impl<T> Stream for ReplyStream<T> {
    type Item = Result<T, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.as_mut().poll_next(cx)
    }
}
