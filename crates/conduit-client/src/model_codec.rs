//! The encode/decode glue every channel needs: a typed [`Model`] on the way
//! in, a typed `Model` on the way out, with a [`Codec`] and the `{request}`
//! top-level `Value::Message` wrapping `#[conduit::endpoint]`'s generated
//! handlers already assume (see `conduit_macros::expand_endpoint`).

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use conduit_core::{Codec, Model, RpcError, Value};

pub fn encode_request<Req: Model>(codec: &dyn Codec, request: &Req) -> Bytes {
    codec.encode(&Value::Message(request.project()), &Req::schema())
}

pub fn decode_reply<Rep: Model>(codec: &dyn Codec, bytes: &[u8]) -> Result<Rep, RpcError> {
    let value = codec.decode(bytes, &Rep::schema())?;
    let fields = match value {
        Value::Message(fields) => fields,
        _ => BTreeMap::new(),
    };
    Rep::construct(fields)
}

/// Same as [`decode_reply`], but for channels that hold the codec behind an
/// `Arc` (every transport-backed channel does, to share it with background
/// tasks that demultiplex a connection's frames).
pub fn decode_reply_arc<Rep: Model>(codec: &Arc<dyn Codec>, bytes: &[u8]) -> Result<Rep, RpcError> {
    decode_reply(codec.as_ref(), bytes)
}
