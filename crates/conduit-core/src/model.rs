//! Generic value representation, schemas, and the `Model` construction /
//! projection contract that every request and reply type implements.

use std::collections::BTreeMap;

use crate::error::{RpcError, ViolationSet};

/// The four request/reply cardinalities a dispatch endpoint can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    /// Single request, single reply.
    UnaryUnary,
    /// Streamed requests, single reply.
    StreamUnary,
    /// Single request, streamed replies.
    UnaryStream,
    /// Streamed requests, streamed replies.
    StreamStream,
}

impl Cardinality {
    pub fn request_is_stream(self) -> bool {
        matches!(self, Cardinality::StreamUnary | Cardinality::StreamStream)
    }

    pub fn reply_is_stream(self) -> bool {
        matches!(self, Cardinality::UnaryStream | Cardinality::StreamStream)
    }
}

/// One branch of a tagged union (`oneof`). At most one branch is active on
/// any given value; `default_value` (when set) overrides the branch type's
/// ordinary scalar zero for the branch the schema marks `is_default` --
/// needed because a source IDL can declare a non-zero default for a oneof
/// branch (`[default = true]`-style), and that default cannot otherwise be
/// recovered from the branch's `LogicalType` alone (S3).
#[derive(Debug, Clone, PartialEq)]
pub struct OneofBranch {
    pub name: String,
    pub ty: LogicalType,
    pub is_default: bool,
    pub default_value: Option<Value>,
}

impl OneofBranch {
    pub fn new(name: impl Into<String>, ty: LogicalType) -> Self {
        OneofBranch {
            name: name.into(),
            ty,
            is_default: false,
            default_value: None,
        }
    }

    pub fn default_branch(mut self, value: Option<Value>) -> Self {
        self.is_default = true;
        self.default_value = value;
        self
    }
}

/// The logical type of a single model field, independent of wire encoding.
/// The Binary-IDL codec and the JSON codec both project onto this set.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalType {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Float,
    Double,
    String,
    Bytes,
    /// A nested message, named by its schema path (`<package>.<Name>`).
    Message(String),
    /// A repeated field of the given element type.
    Repeated(Box<LogicalType>),
    /// A map field; keys are always strings or integers at the model level,
    /// values are whatever logical type the schema declares.
    Map(Box<LogicalType>),
    /// A well-known timestamp (`seconds: i64`, `nanos: i32`).
    Timestamp,
    /// A oneof (tagged union) over the named branches.
    Oneof(Vec<OneofBranch>),
}

/// A single field in a schema: name, logical type, and whether it is
/// required to be present when decoding (scalar fields are never required;
/// their absence just means the default).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub ty: LogicalType,
}

/// The schema for one request or reply type: its fully-qualified name and
/// ordered field list. Field order matters for the Binary-IDL codec's tag
/// assignment (tags are 1-based, in declaration order) and has no effect on
/// the JSON codec.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
    /// When set, codecs emit/accept camelCase wire keys for this schema's
    /// own field names while in-memory names stay snake_case (§4.2). Nested
    /// generic mappings that happen to be a field's *value* are never
    /// transformed by this flag -- only schema-owned keys are.
    pub camel_case: bool,
}

impl Schema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Schema {
            name: name.into(),
            fields,
            camel_case: false,
        }
    }

    pub fn with_camel_case(mut self, camel_case: bool) -> Self {
        self.camel_case = camel_case;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Project a snake_case field name to its wire key, honoring
    /// `camel_case`.
    pub fn wire_key(&self, field_name: &str) -> String {
        if self.camel_case {
            snake_to_camel(field_name)
        } else {
            field_name.to_string()
        }
    }
}

/// `some_field_name` -> `someFieldName`.
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// A well-known timestamp, the Rust-side counterpart of `LogicalType::Timestamp`
/// / `Value::Timestamp`. Kept as a plain struct rather than routed through a
/// calendar crate: conduit only ever carries this value opaquely between a
/// caller and a handler, it never formats or arithmetic's on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

/// Rust-side counterpart of a schema `oneof` (§3): implemented by
/// `#[derive(conduit_macros::ConduitOneof)]` for an enum whose variants each
/// carry exactly one field.
pub trait ConduitOneof: Sized {
    /// The branch table, in declaration order. Tag assignment for
    /// Binary-IDL and default-branch resolution both read this.
    fn branches() -> Vec<OneofBranch>;

    /// Project the active variant to its wire `Value`.
    fn into_value(&self) -> Value;

    /// Reconstruct from a decoded `Value::Oneof(branch, payload)`.
    fn from_value(value: Value) -> Result<Self, RpcError>;
}

/// A value in the generic field-name -> value mapping used for both
/// construction (decode -> model) and projection (model -> encode).
///
/// `BTreeMap` is used for map/nested representations rather than `HashMap`
/// so iteration order is deterministic in tests and trace logs.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Uint32(u32),
    Uint64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Message(BTreeMap<String, Value>),
    Repeated(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Timestamp { seconds: i64, nanos: i32 },
    /// A oneof value: the chosen variant's name plus its payload.
    Oneof(String, Box<Value>),
    /// A field absent from the encoded form; materializes as the logical
    /// type's zero value on construction.
    Absent,
}

impl Value {
    /// The scalar default for a logical type, used when a field is absent
    /// on the wire (default-elision, per the Binary-IDL codec rules).
    pub fn default_for(ty: &LogicalType) -> Value {
        match ty {
            LogicalType::Bool => Value::Bool(false),
            LogicalType::Int32 => Value::Int32(0),
            LogicalType::Int64 => Value::Int64(0),
            LogicalType::Uint32 => Value::Uint32(0),
            LogicalType::Uint64 => Value::Uint64(0),
            LogicalType::Float => Value::Float(0.0),
            LogicalType::Double => Value::Double(0.0),
            LogicalType::String => Value::String(String::new()),
            LogicalType::Bytes => Value::Bytes(Vec::new()),
            LogicalType::Message(_) => Value::Message(BTreeMap::new()),
            LogicalType::Repeated(_) => Value::Repeated(Vec::new()),
            LogicalType::Map(_) => Value::Map(BTreeMap::new()),
            LogicalType::Timestamp => Value::Timestamp {
                seconds: 0,
                nanos: 0,
            },
            LogicalType::Oneof(branches) => match branches.iter().find(|b| b.is_default) {
                Some(branch) => Value::Oneof(
                    branch.name.clone(),
                    Box::new(
                        branch
                            .default_value
                            .clone()
                            .unwrap_or_else(|| Value::default_for(&branch.ty)),
                    ),
                ),
                None => Value::Absent,
            },
        }
    }
}

/// Construction and projection contract shared by every request/reply type.
///
/// `#[derive(conduit_macros::Model)]` implements this for plain structs by
/// generating the field table at compile time; hand-written implementations
/// are also valid (e.g. for types with custom validation).
pub trait Model: Sized {
    /// The schema describing this type's wire shape.
    fn schema() -> Schema;

    /// Validate and construct a value from a generic field mapping,
    /// accumulating every violation before returning, per
    /// `RpcError::InvalidArgument`'s all-at-once contract.
    fn construct(fields: BTreeMap<String, Value>) -> Result<Self, RpcError>;

    /// Project this value into a generic field mapping for encoding.
    fn project(&self) -> BTreeMap<String, Value>;
}

/// Marker for a `Model` implementation that skips validation because its
/// input is already known-valid (internal call sites, codec round-trips).
/// Construction through this path can only fail on a logic error, never on
/// caller input, so it returns an `RpcError::Internal` rather than
/// `InvalidArgument`.
pub trait LeanConstruct: Model {
    fn construct_lean(fields: BTreeMap<String, Value>) -> Result<Self, RpcError> {
        Self::construct(fields).map_err(|_| RpcError::Internal)
    }
}

impl<T: Model> LeanConstruct for T {}

/// Small helper for `Model::construct` implementations: pull a field out of
/// the mapping, falling back to the logical-type default when absent, and
/// recording a violation through `violations` when the value doesn't match
/// the expected shape.
pub fn take_field(
    fields: &mut BTreeMap<String, Value>,
    name: &str,
    ty: &LogicalType,
) -> Value {
    fields
        .remove(name)
        .unwrap_or_else(|| Value::default_for(ty))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_for_scalars_matches_logical_type() {
        assert_eq!(Value::default_for(&LogicalType::Int32), Value::Int32(0));
        assert_eq!(
            Value::default_for(&LogicalType::String),
            Value::String(String::new())
        );
    }

    #[test]
    fn schema_field_lookup() {
        let schema = Schema::new(
            "pkg.Msg",
            vec![FieldSchema {
                name: "id".into(),
                ty: LogicalType::Int32,
            }],
        );
        assert!(schema.field("id").is_some());
        assert!(schema.field("missing").is_none());
    }

    #[test]
    fn take_field_falls_back_to_default() {
        let mut fields = BTreeMap::new();
        let v = take_field(&mut fields, "missing", &LogicalType::Bool);
        assert_eq!(v, Value::Bool(false));
    }

    #[test]
    fn snake_to_camel_converts_field_names() {
        assert_eq!(snake_to_camel("country_info_by_id"), "countryInfoById");
        assert_eq!(snake_to_camel("id"), "id");
    }

    #[test]
    fn wire_key_only_transforms_when_camel_case_is_set() {
        let plain = Schema::new("pkg.Msg", vec![]);
        assert_eq!(plain.wire_key("bool_value"), "bool_value");
        let camel = Schema::new("pkg.Msg", vec![]).with_camel_case(true);
        assert_eq!(camel.wire_key("bool_value"), "boolValue");
    }

    #[test]
    fn cardinality_stream_flags() {
        assert!(!Cardinality::UnaryUnary.request_is_stream());
        assert!(Cardinality::StreamStream.request_is_stream());
        assert!(Cardinality::UnaryStream.reply_is_stream());
        assert!(!Cardinality::StreamUnary.reply_is_stream());
    }
}
