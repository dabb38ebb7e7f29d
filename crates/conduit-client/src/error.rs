//! Errors a channel can raise that don't already fit [`RpcError`]: things
//! that go wrong below the dispatch boundary -- a connection that never
//! came up, a malformed frame from the wire -- rather than an RPC outcome
//! the server deliberately returned.

use conduit_core::RpcError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The call completed and the server returned a canonical RPC error.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The underlying connection could not be established or was lost
    /// before a reply arrived.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame from the wire didn't match the shape this channel expects
    /// (malformed JSON envelope, missing header, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// This channel's transport doesn't support the requested cardinality
    /// (e.g. client-streaming over HTTP/WebSocket, per §4.7.2).
    #[error("{0} is not supported by this channel")]
    Unsupported(&'static str),
}

impl From<crate::bus::BusChannelError> for ClientError {
    fn from(err: crate::bus::BusChannelError) -> Self {
        match err {
            crate::bus::BusChannelError::Handshake(msg) => ClientError::Protocol(msg),
            crate::bus::BusChannelError::Closed => ClientError::Transport("connection closed".to_string()),
        }
    }
}

impl ClientError {
    /// Collapse to the canonical [`RpcError`] a caller that only cares
    /// about the RPC-level outcome can match on; transport/protocol
    /// failures below the dispatch boundary become `Unavailable`.
    pub fn into_rpc_error(self) -> RpcError {
        match self {
            ClientError::Rpc(err) => err,
            ClientError::Transport(_) | ClientError::Protocol(_) | ClientError::Unsupported(_) => {
                RpcError::Unavailable
            }
        }
    }
}
