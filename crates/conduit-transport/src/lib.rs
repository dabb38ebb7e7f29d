//! Shared transport seam (C7): the `Transport` lifecycle contract every
//! adapter implements, plus the routing/dispatch glue common to all four
//! mandated adapters (§4.7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conduit_core::dispatch::{got_request, DispatchOutcome, RequestBytes};
use conduit_core::{CancelToken, Codec, Metadata, Path, RpcError};
use conduit_registry::Router;

/// Lifecycle contract every transport adapter implements (§4.7): `start`,
/// `stop`, and (internally, not part of this trait) a bridge to
/// `conduit_core::dispatch`. Both `start` and `stop` must be idempotent;
/// `stop` without a prior `start` is a warning, not an error (§4.7.5) --
/// see [`LifecycleGuard`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<(), TransportError>;
    async fn stop(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport bind failed: {0}")]
    Bind(String),
}

/// Idempotent start/stop bookkeeping shared by every adapter, so "stop
/// without start is a warning" (§4.7.5) doesn't need reimplementing once
/// per transport.
#[derive(Default)]
pub struct LifecycleGuard {
    started: AtomicBool,
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark started. Calling this twice with no intervening `mark_stopped`
    /// is harmless -- starting an already-started transport is idempotent.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Mark stopped, returning whether the transport had actually been
    /// started. A caller that gets back `false` should log a warning
    /// rather than treat it as an error.
    pub fn mark_stopped(&self) -> bool {
        self.started.swap(false, Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// Resolve `path` against `router` and drive it through the dispatch
/// engine. An unmapped path becomes `RpcError::NotFound`, rendered through
/// `codec` exactly like any other dispatch-time failure (§7: "Unknown path
/// on any transport -> NotFound").
pub async fn dispatch(
    router: &Router,
    codec: Arc<dyn Codec>,
    path: &Path,
    request: RequestBytes,
    metadata: Metadata,
    cancel: CancelToken,
) -> DispatchOutcome {
    match router.route(path) {
        Some(endpoint) => got_request(Arc::new(endpoint), codec, request, metadata, cancel).await,
        None => {
            tracing::warn!(%path, "no endpoint registered for path");
            DispatchOutcome::Unary(codec.encode_error(&RpcError::NotFound))
        }
    }
}

/// Like [`dispatch`], but keeps the originating `RpcError` alongside the
/// encoded bytes for transports that map it onto their own status channel
/// (gRPC status codes, HTTP status codes, event-bus ack tuples).
pub async fn dispatch_typed(
    router: &Router,
    codec: Arc<dyn Codec>,
    path: &Path,
    request: RequestBytes,
    metadata: Metadata,
    cancel: CancelToken,
) -> conduit_core::dispatch::Outcome {
    use conduit_core::dispatch::Outcome;

    match router.route(path) {
        Some(endpoint) => {
            conduit_core::dispatch::run(Arc::new(endpoint), codec, request, metadata, cancel).await
        }
        None => {
            tracing::warn!(%path, "no endpoint registered for path");
            Outcome::Unary(Err(RpcError::NotFound))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_guard_reports_stop_without_start() {
        let guard = LifecycleGuard::new();
        assert!(!guard.mark_stopped());
        guard.mark_started();
        assert!(guard.is_started());
        assert!(guard.mark_stopped());
        assert!(!guard.is_started());
    }

    #[test]
    fn lifecycle_guard_start_is_idempotent() {
        let guard = LifecycleGuard::new();
        guard.mark_started();
        guard.mark_started();
        assert!(guard.is_started());
    }
}
