//! The Binary-IDL codec (§4.3): a protobuf-shaped TLV wire format with
//! structural fidelity to every logical type in §3 -- scalar default
//! elision, repeated/message/map fields, `oneof`, the well-known Timestamp,
//! and nested messages.
//!
//! Field tags are not stored on [`conduit_core::FieldSchema`]; they are
//! derived purely from declaration order (1-based), per the comment on
//! `Schema::fields`. A `oneof` field consumes one tag per branch rather than
//! one tag for the whole field, matching how a real `.proto` oneof reserves
//! a separate field number per branch.

mod wire;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use conduit_core::{Codec, FieldSchema, LogicalType, OneofBranch, RpcError, Schema, Value};

use crate::schema_registry::SchemaRegistry;
use crate::status::Status;
use wire::{read_raw_fields, write_length_delimited, write_tag, RawValue, WireType};

/// Where one allocated wire tag points back into a schema's field list.
enum TagSlot<'a> {
    Field(&'a FieldSchema),
    OneofBranch(&'a FieldSchema, &'a OneofBranch),
}

/// Assign a 1-based wire tag to every field, expanding `oneof` fields into
/// one tag per branch, in declaration order.
fn allocate_tags(schema: &Schema) -> Vec<(u32, TagSlot<'_>)> {
    let mut tags = Vec::new();
    let mut next = 1u32;
    for field in &schema.fields {
        match &field.ty {
            LogicalType::Oneof(branches) => {
                for branch in branches {
                    tags.push((next, TagSlot::OneofBranch(field, branch)));
                    next += 1;
                }
            }
            _ => {
                tags.push((next, TagSlot::Field(field)));
                next += 1;
            }
        }
    }
    tags
}

fn internal(message: &str) -> RpcError {
    RpcError::ServerError {
        message: Some(message.to_string()),
    }
}

/// The stateless Binary-IDL codec. Holds only the schema registry handed to
/// it at construction (§4.3: "stateless across calls except for a
/// schema-lookup table").
pub struct BinaryIdlCodec {
    registry: Arc<SchemaRegistry>,
}

impl BinaryIdlCodec {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        BinaryIdlCodec { registry }
    }

    fn resolve(&self, path: &str) -> Result<Schema, RpcError> {
        self.registry
            .get(path)
            .ok_or_else(|| internal(&format!("unknown schema: {path}")))
    }
}

impl Codec for BinaryIdlCodec {
    fn decode(&self, bytes: &[u8], schema: &Schema) -> Result<Value, RpcError> {
        let fields = decode_message(bytes, schema, &self.registry)?;
        Ok(Value::Message(fields))
    }

    fn encode(&self, value: &Value, schema: &Schema) -> Bytes {
        let fields = match value {
            Value::Message(fields) => fields.clone(),
            other => {
                tracing::error!("binary-idl encode called with non-message top-level value");
                let _ = other;
                BTreeMap::new()
            }
        };
        let mut out = Vec::new();
        encode_message(&fields, schema, &self.registry, &mut out);
        Bytes::from(out)
    }

    fn encode_error(&self, err: &RpcError) -> Bytes {
        let status = Status::from(err);
        Bytes::from(encode_status(&status))
    }

    fn name(&self) -> &'static str {
        "binary-idl"
    }
}

// ---------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------

fn encode_message(
    fields_map: &BTreeMap<String, Value>,
    schema: &Schema,
    registry: &SchemaRegistry,
    out: &mut Vec<u8>,
) {
    for (tag, slot) in allocate_tags(schema) {
        match slot {
            TagSlot::Field(field) => {
                let value = fields_map
                    .get(&field.name)
                    .cloned()
                    .unwrap_or_else(|| Value::default_for(&field.ty));
                encode_field(tag, &field.ty, &value, registry, out);
            }
            TagSlot::OneofBranch(field, branch) => {
                if let Some(Value::Oneof(active, inner)) = fields_map.get(&field.name) {
                    if active == &branch.name {
                        encode_field(tag, &branch.ty, inner, registry, out);
                    }
                }
            }
        }
    }
}

/// Encode one field's value at `tag`, eliding scalar defaults and empty
/// repeated/map fields per the Binary-IDL codec's rules 1-2.
fn encode_field(tag: u32, ty: &LogicalType, value: &Value, registry: &SchemaRegistry, out: &mut Vec<u8>) {
    match ty {
        LogicalType::Bool => {
            if let Value::Bool(b) = value {
                if *b {
                    write_tag(tag, WireType::Varint, out);
                    wire::encode_varint(1, out);
                }
            }
        }
        LogicalType::Int32 => write_signed(tag, value_as_i64(value), out),
        LogicalType::Int64 => write_signed(tag, value_as_i64(value), out),
        LogicalType::Uint32 => write_unsigned(tag, value_as_u64(value), out),
        LogicalType::Uint64 => write_unsigned(tag, value_as_u64(value), out),
        LogicalType::Float => {
            if let Value::Float(f) = value {
                if *f != 0.0 {
                    write_tag(tag, WireType::Fixed32, out);
                    out.extend_from_slice(&f.to_bits().to_le_bytes());
                }
            }
        }
        LogicalType::Double => {
            if let Value::Double(d) = value {
                if *d != 0.0 {
                    write_tag(tag, WireType::Fixed64, out);
                    out.extend_from_slice(&d.to_bits().to_le_bytes());
                }
            }
        }
        LogicalType::String => {
            if let Value::String(s) = value {
                if !s.is_empty() {
                    write_length_delimited(tag, s.as_bytes(), out);
                }
            }
        }
        LogicalType::Bytes => {
            if let Value::Bytes(b) = value {
                if !b.is_empty() {
                    write_length_delimited(tag, b, out);
                }
            }
        }
        LogicalType::Message(path) => {
            if let Value::Message(fields) = value {
                if let Some(nested_schema) = registry.get(path) {
                    let mut buf = Vec::new();
                    encode_message(fields, &nested_schema, registry, &mut buf);
                    write_length_delimited(tag, &buf, out);
                }
            }
        }
        LogicalType::Timestamp => {
            if let Value::Timestamp { seconds, nanos } = value {
                let mut buf = Vec::new();
                if *seconds != 0 {
                    write_tag(1, WireType::Varint, &mut buf);
                    wire::encode_varint(*seconds as u64, &mut buf);
                }
                if *nanos != 0 {
                    write_tag(2, WireType::Varint, &mut buf);
                    wire::encode_varint(*nanos as u64, &mut buf);
                }
                if !buf.is_empty() {
                    write_length_delimited(tag, &buf, out);
                }
            }
        }
        LogicalType::Repeated(inner) => {
            if let Value::Repeated(items) = value {
                for item in items {
                    encode_field(tag, inner, item, registry, out);
                }
            }
        }
        LogicalType::Map(inner) => {
            if let Value::Map(entries) = value {
                for (key, val) in entries {
                    let mut entry = Vec::new();
                    write_length_delimited(1, key.as_bytes(), &mut entry);
                    encode_field(2, inner, val, registry, &mut entry);
                    write_length_delimited(tag, &entry, out);
                }
            }
        }
        LogicalType::Oneof(_) => {
            // Handled by `encode_message`'s `TagSlot::OneofBranch` arm; a
            // oneof never appears as the element type of a repeated/map
            // field or a nested branch.
        }
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int32(v) => Some(*v as i64),
        Value::Int64(v) => Some(*v),
        _ => None,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Uint32(v) => Some(*v as u64),
        Value::Uint64(v) => Some(*v),
        _ => None,
    }
}

fn write_signed(tag: u32, value: Option<i64>, out: &mut Vec<u8>) {
    if let Some(v) = value {
        if v != 0 {
            write_tag(tag, WireType::Varint, out);
            wire::encode_varint(v as u64, out);
        }
    }
}

fn write_unsigned(tag: u32, value: Option<u64>, out: &mut Vec<u8>) {
    if let Some(v) = value {
        if v != 0 {
            write_tag(tag, WireType::Varint, out);
            wire::encode_varint(v, out);
        }
    }
}

// ---------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------

fn decode_message(
    bytes: &[u8],
    schema: &Schema,
    registry: &SchemaRegistry,
) -> Result<BTreeMap<String, Value>, RpcError> {
    let raw = read_raw_fields(bytes)?;
    let mut by_tag: BTreeMap<u32, Vec<&RawValue>> = BTreeMap::new();
    for (tag, value) in &raw {
        by_tag.entry(*tag).or_default().push(value);
    }

    let mut out = BTreeMap::new();
    for (tag, slot) in allocate_tags(schema) {
        match slot {
            TagSlot::Field(field) => {
                let value = match &field.ty {
                    LogicalType::Repeated(inner) => {
                        let items = by_tag
                            .get(&tag)
                            .map(|values| {
                                values
                                    .iter()
                                    .map(|raw| decode_scalar(raw, inner, registry))
                                    .collect::<Result<Vec<_>, _>>()
                            })
                            .transpose()?
                            .unwrap_or_default();
                        Value::Repeated(items)
                    }
                    LogicalType::Map(inner) => {
                        let mut entries = BTreeMap::new();
                        if let Some(values) = by_tag.get(&tag) {
                            for raw in values {
                                let (key, val) = decode_map_entry(raw, inner, registry)?;
                                entries.insert(key, val);
                            }
                        }
                        Value::Map(entries)
                    }
                    other_ty => match by_tag.get(&tag).and_then(|v| v.last()) {
                        Some(raw) => decode_scalar(raw, other_ty, registry)?,
                        None => Value::default_for(other_ty),
                    },
                };
                out.insert(field.name.clone(), value);
            }
            TagSlot::OneofBranch(field, _branch) => {
                // Only materialize the oneof's `Value` once, on its first
                // branch tag; see the match arm below for the actual
                // resolution across all branches.
                if !out.contains_key(&field.name) {
                    out.insert(field.name.clone(), decode_oneof(field, schema, &by_tag, registry)?);
                }
            }
        }
    }
    Ok(out)
}

fn decode_oneof(
    field: &FieldSchema,
    schema: &Schema,
    by_tag: &BTreeMap<u32, Vec<&RawValue>>,
    registry: &SchemaRegistry,
) -> Result<Value, RpcError> {
    let LogicalType::Oneof(branches) = &field.ty else {
        return Err(internal("decode_oneof called on non-oneof field"));
    };
    let tags = allocate_tags(schema);
    for (tag, slot) in &tags {
        if let TagSlot::OneofBranch(f, branch) = slot {
            if f.name != field.name {
                continue;
            }
            if let Some(values) = by_tag.get(tag) {
                if let Some(raw) = values.last() {
                    let decoded = decode_scalar(raw, &branch.ty, registry)?;
                    return Ok(Value::Oneof(branch.name.clone(), Box::new(decoded)));
                }
            }
        }
    }
    let _ = branches;
    Ok(Value::default_for(&field.ty))
}

fn decode_map_entry(
    raw: &RawValue,
    value_ty: &LogicalType,
    registry: &SchemaRegistry,
) -> Result<(String, Value), RpcError> {
    let bytes = raw.as_length_delimited()?;
    let entries = read_raw_fields(bytes)?;
    let mut key = String::new();
    let mut value = Value::default_for(value_ty);
    for (tag, raw_value) in &entries {
        match tag {
            1 => {
                key = match raw_value {
                    RawValue::LengthDelimited(b) => String::from_utf8(b.clone())
                        .map_err(|_| RpcError::invalid_field("<map key>", "invalid utf-8"))?,
                    RawValue::Varint(v) => v.to_string(),
                    _ => return Err(internal("unsupported map key wire type")),
                };
            }
            2 => value = decode_scalar(raw_value, value_ty, registry)?,
            _ => {}
        }
    }
    Ok((key, value))
}

fn decode_scalar(raw: &RawValue, ty: &LogicalType, registry: &SchemaRegistry) -> Result<Value, RpcError> {
    match ty {
        LogicalType::Bool => Ok(Value::Bool(raw.as_varint()? != 0)),
        LogicalType::Int32 => Ok(Value::Int32(raw.as_varint()? as i64 as i32)),
        LogicalType::Int64 => Ok(Value::Int64(raw.as_varint()? as i64)),
        LogicalType::Uint32 => Ok(Value::Uint32(raw.as_varint()? as u32)),
        LogicalType::Uint64 => Ok(Value::Uint64(raw.as_varint()?)),
        LogicalType::Float => match raw {
            RawValue::Fixed32(bytes) => Ok(Value::Float(f32::from_bits(u32::from_le_bytes(*bytes)))),
            _ => Err(internal("expected fixed32 for float field")),
        },
        LogicalType::Double => match raw {
            RawValue::Fixed64(bytes) => Ok(Value::Double(f64::from_bits(u64::from_le_bytes(*bytes)))),
            _ => Err(internal("expected fixed64 for double field")),
        },
        LogicalType::String => {
            let bytes = raw.as_length_delimited()?;
            String::from_utf8(bytes.to_vec())
                .map(Value::String)
                .map_err(|_| RpcError::invalid_field("<string field>", "invalid utf-8"))
        }
        LogicalType::Bytes => Ok(Value::Bytes(raw.as_length_delimited()?.to_vec())),
        LogicalType::Message(path) => {
            let nested_schema = registry
                .get(path)
                .ok_or_else(|| internal(&format!("unknown schema: {path}")))?;
            let bytes = raw.as_length_delimited()?;
            let fields = decode_message(bytes, &nested_schema, registry)?;
            Ok(Value::Message(fields))
        }
        LogicalType::Timestamp => {
            let bytes = raw.as_length_delimited()?;
            let entries = read_raw_fields(bytes)?;
            let mut seconds = 0i64;
            let mut nanos = 0i32;
            for (tag, value) in &entries {
                match tag {
                    1 => seconds = value.as_varint()? as i64,
                    2 => nanos = value.as_varint()? as i32,
                    _ => {}
                }
            }
            Ok(Value::Timestamp { seconds, nanos })
        }
        LogicalType::Repeated(_) | LogicalType::Map(_) | LogicalType::Oneof(_) => {
            Err(internal("nested repeated/map/oneof fields are not supported"))
        }
    }
}

// ---------------------------------------------------------------------
// Error status wire encoding (§4.3 rule 8)
// ---------------------------------------------------------------------

fn status_code_ordinal(code: crate::status::StatusCode) -> u32 {
    use crate::status::StatusCode::*;
    match code {
        Ok => 0,
        Cancelled => 1,
        Unknown => 2,
        InvalidArgument => 3,
        DeadlineExceeded => 4,
        NotFound => 5,
        PermissionDenied => 7,
        Unauthenticated => 16,
        Unavailable => 14,
        Internal => 13,
    }
}

/// Encode a `Status{code, message, details}` the same way any other
/// Binary-IDL message would be encoded, using fixed tag numbers 1-3.
fn encode_status(status: &Status) -> Vec<u8> {
    let mut out = Vec::new();
    write_tag(1, WireType::Varint, &mut out);
    wire::encode_varint(status_code_ordinal(status.code) as u64, &mut out);
    if !status.message.is_empty() {
        write_length_delimited(2, status.message.as_bytes(), &mut out);
    }
    if let Some(details) = &status.details {
        let mut details_buf = Vec::new();
        for (field, message) in &details.field_violations {
            let mut entry = Vec::new();
            write_length_delimited(1, field.as_bytes(), &mut entry);
            write_length_delimited(2, message.as_bytes(), &mut entry);
            write_length_delimited(1, &entry, &mut details_buf);
        }
        write_length_delimited(3, &details_buf, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::FieldSchema;

    fn registry_with(schemas: Vec<Schema>) -> Arc<SchemaRegistry> {
        let registry = Arc::new(SchemaRegistry::new());
        for schema in schemas {
            registry.register(schema);
        }
        registry
    }

    fn scalars_schema() -> Schema {
        Schema::new(
            "test.MessageWithScalars",
            vec![
                FieldSchema {
                    name: "double_value".into(),
                    ty: LogicalType::Double,
                },
                FieldSchema {
                    name: "int32_value".into(),
                    ty: LogicalType::Int32,
                },
                FieldSchema {
                    name: "bool_value".into(),
                    ty: LogicalType::Bool,
                },
                FieldSchema {
                    name: "string_value".into(),
                    ty: LogicalType::String,
                },
                FieldSchema {
                    name: "bytes_value".into(),
                    ty: LogicalType::Bytes,
                },
            ],
        )
    }

    #[test]
    fn scalar_round_trip() {
        let schema = scalars_schema();
        let registry = registry_with(vec![schema.clone()]);
        let codec = BinaryIdlCodec::new(registry);

        let mut fields = BTreeMap::new();
        fields.insert("double_value".into(), Value::Double(7821931.22));
        fields.insert("int32_value".into(), Value::Int32(-83424));
        fields.insert("bool_value".into(), Value::Bool(true));
        fields.insert(
            "string_value".into(),
            Value::String("string in message to convert".into()),
        );
        fields.insert("bytes_value".into(), Value::Bytes(vec![1, 2, 3, 4]));
        let value = Value::Message(fields);

        let bytes = codec.encode(&value, &schema);
        let decoded = codec.decode(&bytes, &schema).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn empty_frame_decodes_to_all_defaults() {
        let schema = scalars_schema();
        let registry = registry_with(vec![schema.clone()]);
        let codec = BinaryIdlCodec::new(registry);

        let decoded = codec.decode(&[], &schema).unwrap();
        match decoded {
            Value::Message(fields) => {
                assert_eq!(fields["double_value"], Value::Double(0.0));
                assert_eq!(fields["int32_value"], Value::Int32(0));
                assert_eq!(fields["bool_value"], Value::Bool(false));
                assert_eq!(fields["string_value"], Value::String(String::new()));
                assert_eq!(fields["bytes_value"], Value::Bytes(Vec::new()));
            }
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn all_default_value_encodes_to_empty_frame() {
        let schema = scalars_schema();
        let registry = registry_with(vec![schema.clone()]);
        let codec = BinaryIdlCodec::new(registry);

        let mut fields = BTreeMap::new();
        for field in &schema.fields {
            fields.insert(field.name.clone(), Value::default_for(&field.ty));
        }
        let bytes = codec.encode(&Value::Message(fields), &schema);
        assert!(bytes.is_empty());
    }

    fn oneof_schema() -> Schema {
        Schema::new(
            "test.MessageWithOneofs",
            vec![
                FieldSchema {
                    name: "bool_or_str".into(),
                    ty: LogicalType::Oneof(vec![
                        OneofBranch::new("bool_value", LogicalType::Bool).default_branch(Some(Value::Bool(true))),
                        OneofBranch::new("str_value", LogicalType::String),
                    ]),
                },
                FieldSchema {
                    name: "double_or_str".into(),
                    ty: LogicalType::Oneof(vec![
                        OneofBranch::new("double_value", LogicalType::Double),
                        OneofBranch::new("str_value", LogicalType::String)
                            .default_branch(Some(Value::String("default_string".into()))),
                    ]),
                },
            ],
        )
    }

    #[test]
    fn oneof_empty_frame_yields_declared_defaults() {
        let schema = oneof_schema();
        let registry = registry_with(vec![schema.clone()]);
        let codec = BinaryIdlCodec::new(registry);

        let decoded = codec.decode(&[], &schema).unwrap();
        match decoded {
            Value::Message(fields) => {
                assert_eq!(
                    fields["bool_or_str"],
                    Value::Oneof("bool_value".into(), Box::new(Value::Bool(true)))
                );
                assert_eq!(
                    fields["double_or_str"],
                    Value::Oneof(
                        "str_value".into(),
                        Box::new(Value::String("default_string".into()))
                    )
                );
            }
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn oneof_round_trips_active_branch() {
        let schema = oneof_schema();
        let registry = registry_with(vec![schema.clone()]);
        let codec = BinaryIdlCodec::new(registry);

        let mut fields = BTreeMap::new();
        fields.insert(
            "bool_or_str".into(),
            Value::Oneof("str_value".into(), Box::new(Value::String("hi".into()))),
        );
        fields.insert(
            "double_or_str".into(),
            Value::Oneof("double_value".into(), Box::new(Value::Double(4.5))),
        );
        let value = Value::Message(fields);

        let bytes = codec.encode(&value, &schema);
        let decoded = codec.decode(&bytes, &schema).unwrap();
        assert_eq!(decoded, value);
    }

    fn city_schema() -> Schema {
        Schema::new(
            "test.CityInfo",
            vec![
                FieldSchema {
                    name: "name".into(),
                    ty: LogicalType::String,
                },
                FieldSchema {
                    name: "population".into(),
                    ty: LogicalType::Double,
                },
            ],
        )
    }

    fn country_schema() -> Schema {
        Schema::new(
            "test.CountryInfo",
            vec![
                FieldSchema {
                    name: "name".into(),
                    ty: LogicalType::String,
                },
                FieldSchema {
                    name: "cities_by_id".into(),
                    ty: LogicalType::Map(Box::new(LogicalType::Message("test.CityInfo".into()))),
                },
            ],
        )
    }

    #[test]
    fn map_with_nested_message_values_round_trips() {
        let registry = registry_with(vec![city_schema(), country_schema()]);
        let codec = BinaryIdlCodec::new(registry);

        let mut lviv = BTreeMap::new();
        lviv.insert("name".into(), Value::String("Lviv".into()));
        lviv.insert("population".into(), Value::Double(148.9));

        let mut kyiv = BTreeMap::new();
        kyiv.insert("name".into(), Value::String("Kyiv".into()));
        kyiv.insert("population".into(), Value::Double(839.0));

        let mut cities = BTreeMap::new();
        cities.insert("79000".into(), Value::Message(lviv));
        cities.insert("01001".into(), Value::Message(kyiv));

        let mut country = BTreeMap::new();
        country.insert("name".into(), Value::String("Ukraine".into()));
        country.insert("cities_by_id".into(), Value::Map(cities));

        let value = Value::Message(country);
        let schema = country_schema();
        let bytes = codec.encode(&value, &schema);
        let decoded = codec.decode(&bytes, &schema).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn repeated_scalar_round_trips_and_empty_encodes_to_nothing() {
        let schema = Schema::new(
            "test.Repeated",
            vec![FieldSchema {
                name: "tags".into(),
                ty: LogicalType::Repeated(Box::new(LogicalType::String)),
            }],
        );
        let registry = registry_with(vec![schema.clone()]);
        let codec = BinaryIdlCodec::new(registry);

        let mut empty = BTreeMap::new();
        empty.insert("tags".into(), Value::Repeated(vec![]));
        assert!(codec.encode(&Value::Message(empty), &schema).is_empty());

        let mut fields = BTreeMap::new();
        fields.insert(
            "tags".into(),
            Value::Repeated(vec![Value::String("a".into()), Value::String("b".into())]),
        );
        let value = Value::Message(fields);
        let bytes = codec.encode(&value, &schema);
        let decoded = codec.decode(&bytes, &schema).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn timestamp_round_trips_with_microsecond_precision() {
        let schema = Schema::new(
            "test.WithTimestamp",
            vec![FieldSchema {
                name: "created_at".into(),
                ty: LogicalType::Timestamp,
            }],
        );
        let registry = registry_with(vec![schema.clone()]);
        let codec = BinaryIdlCodec::new(registry);

        let mut fields = BTreeMap::new();
        fields.insert(
            "created_at".into(),
            Value::Timestamp {
                seconds: 1_700_000_000,
                nanos: 123_456_000,
            },
        );
        let value = Value::Message(fields);
        let bytes = codec.encode(&value, &schema);
        let decoded = codec.decode(&bytes, &schema).unwrap();
        assert_eq!(decoded, value);
    }
}
