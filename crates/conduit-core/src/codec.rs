//! The codec seam (C3). The trait lives here, in the crate the dispatch
//! engine already depends on, so `conduit-codec`'s concrete implementations
//! can depend *on* `conduit-core` without a cycle; `got_request` is generic
//! over `&dyn Codec` rather than naming a specific wire format.

use bytes::Bytes;

use crate::error::RpcError;
use crate::model::{Schema, Value};

/// Bytes <-> [`Value`] with structural fidelity to a [`Schema`], plus error
/// rendering. Stateless across calls except for whatever schema-lookup table
/// the concrete codec was constructed with (§4.3).
pub trait Codec: Send + Sync {
    /// Decode `bytes` as an instance of `schema`. Empty input decoding to the
    /// all-default value is part of each codec's own contract (JSON treats
    /// empty bytes as `{}`; Binary-IDL treats an empty frame as all scalar
    /// defaults, per invariant 5 and S2).
    fn decode(&self, bytes: &[u8], schema: &Schema) -> Result<Value, RpcError>;

    /// Encode `value`, which must conform to `schema`, to wire bytes.
    fn encode(&self, value: &Value, schema: &Schema) -> Bytes;

    /// Render an [`RpcError`] in this codec's wire error format.
    fn encode_error(&self, err: &RpcError) -> Bytes;

    /// A stable name for diagnostics and HTTP content-type negotiation.
    fn name(&self) -> &'static str;
}
