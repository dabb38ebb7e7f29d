//! The codec subsystem (C3): the JSON and Binary-IDL implementations of
//! `conduit_core::Codec`, plus the schema registry and canonical `Status`
//! shape they share.

pub mod binary_idl;
pub mod json;
mod oneof;
pub mod schema_registry;
pub mod status;

pub use binary_idl::BinaryIdlCodec;
pub use json::JsonCodec;
pub use schema_registry::SchemaRegistry;
pub use status::{BadRequest, Status, StatusCode};
