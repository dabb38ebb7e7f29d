//! The JSON codec (§4.3): canonical JSON, empty bytes decode as `{}`, and
//! the `{"error": <detail>}` error shape.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use conduit_core::{LogicalType, RpcError, Schema, Value};
use serde_json::{Map as JsonMap, Value as Json};

use crate::oneof;
use crate::schema_registry::SchemaRegistry;

fn base64_engine() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// The stateless JSON codec. Like the Binary-IDL codec, the only state it
/// carries is the schema registry used to resolve nested-message and `oneof`
/// branch types by schema path.
pub struct JsonCodec {
    registry: Arc<SchemaRegistry>,
}

impl JsonCodec {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        JsonCodec { registry }
    }
}

impl conduit_core::Codec for JsonCodec {
    fn decode(&self, bytes: &[u8], schema: &Schema) -> Result<Value, RpcError> {
        if bytes.is_empty() {
            let fields = decode_message(&Json::Object(JsonMap::new()), schema, &self.registry)?;
            return Ok(Value::Message(fields));
        }
        let json: Json = serde_json::from_slice(bytes)
            .map_err(|e| RpcError::invalid_field("<body>", format!("invalid JSON: {e}")))?;
        let fields = decode_message(&json, schema, &self.registry)?;
        Ok(Value::Message(fields))
    }

    fn encode(&self, value: &Value, schema: &Schema) -> Bytes {
        let fields = match value {
            Value::Message(fields) => fields.clone(),
            _ => BTreeMap::new(),
        };
        let json = Json::Object(encode_message(&fields, schema, &self.registry));
        Bytes::from(serde_json::to_vec(&json).unwrap_or_default())
    }

    fn encode_error(&self, err: &RpcError) -> Bytes {
        let detail = match err {
            RpcError::NotFound => Json::String("not found".to_string()),
            RpcError::InvalidArgument { field_violations } => Json::Object(
                field_violations
                    .iter()
                    .map(|(k, v)| (k.clone(), Json::String(v.clone())))
                    .collect(),
            ),
            _ => Json::String(RpcError::INTERNAL_SERVER_ERROR_MESSAGE.to_string()),
        };
        let body = serde_json::json!({ "error": detail });
        Bytes::from(serde_json::to_vec(&body).unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

fn encode_message(fields_map: &BTreeMap<String, Value>, schema: &Schema, registry: &SchemaRegistry) -> JsonMap<String, Json> {
    let mut obj = JsonMap::new();
    for field in &schema.fields {
        let value = fields_map
            .get(&field.name)
            .cloned()
            .unwrap_or_else(|| Value::default_for(&field.ty));
        let key = schema.wire_key(&field.name);
        obj.insert(key, value_to_json(&value, &field.ty, registry));
    }
    obj
}

fn value_to_json(value: &Value, ty: &LogicalType, registry: &SchemaRegistry) -> Json {
    match (value, ty) {
        (Value::Oneof(branch_name, inner), LogicalType::Oneof(branches)) => match branches
            .iter()
            .find(|b| &b.name == branch_name)
        {
            Some(branch) => value_to_json(inner, &branch.ty, registry),
            None => Json::Null,
        },
        (Value::Bool(b), _) => Json::Bool(*b),
        (Value::Int32(v), _) => Json::Number((*v).into()),
        (Value::Int64(v), _) => Json::Number((*v).into()),
        (Value::Uint32(v), _) => Json::Number((*v).into()),
        (Value::Uint64(v), _) => Json::Number((*v).into()),
        (Value::Float(v), _) => serde_json::Number::from_f64(*v as f64)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        (Value::Double(v), _) => serde_json::Number::from_f64(*v).map(Json::Number).unwrap_or(Json::Null),
        (Value::String(s), _) => Json::String(s.clone()),
        (Value::Bytes(b), _) => Json::String(base64_engine().encode(b)),
        (Value::Message(fields), LogicalType::Message(path)) => match registry.get(path) {
            Some(nested_schema) => Json::Object(encode_message(fields, &nested_schema, registry)),
            None => Json::Object(JsonMap::new()),
        },
        (Value::Repeated(items), LogicalType::Repeated(inner)) => {
            Json::Array(items.iter().map(|item| value_to_json(item, inner, registry)).collect())
        }
        (Value::Map(entries), LogicalType::Map(inner)) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v, inner, registry)))
                .collect(),
        ),
        (Value::Timestamp { seconds, nanos }, _) => serde_json::json!({ "seconds": seconds, "nanos": nanos }),
        (Value::Absent, _) => Json::Null,
        _ => Json::Null,
    }
}

fn decode_message(json: &Json, schema: &Schema, registry: &SchemaRegistry) -> Result<BTreeMap<String, Value>, RpcError> {
    let obj = match json {
        Json::Object(obj) => obj,
        Json::Null => {
            return Ok(schema
                .fields
                .iter()
                .map(|f| (f.name.clone(), Value::default_for(&f.ty)))
                .collect())
        }
        _ => return Err(RpcError::invalid_field("<body>", "expected a JSON object")),
    };

    let mut violations = conduit_core::ViolationSet::new();
    let mut out = BTreeMap::new();
    for field in &schema.fields {
        let key = schema.wire_key(&field.name);
        let found = obj.get(&key).or_else(|| obj.get(&field.name));
        let value = match found {
            Some(j) => match json_to_value(j, &field.ty, registry) {
                Ok(v) => v,
                Err(_) => {
                    violations.push(field.name.clone(), "does not match the declared type");
                    Value::default_for(&field.ty)
                }
            },
            None => Value::default_for(&field.ty),
        };
        out.insert(field.name.clone(), value);
    }
    violations.into_result()?;
    Ok(out)
}

fn json_to_value(json: &Json, ty: &LogicalType, registry: &SchemaRegistry) -> Result<Value, RpcError> {
    match ty {
        LogicalType::Oneof(branches) => {
            let branch = oneof::best_fit_for_json(branches, json, registry)?;
            let inner = json_to_value(json, &branch.ty, registry)?;
            Ok(Value::Oneof(branch.name.clone(), Box::new(inner)))
        }
        LogicalType::Bool => json.as_bool().map(Value::Bool).ok_or_else(type_err),
        LogicalType::Int32 => json.as_i64().map(|v| Value::Int32(v as i32)).ok_or_else(type_err),
        LogicalType::Int64 => json.as_i64().map(Value::Int64).ok_or_else(type_err),
        LogicalType::Uint32 => json.as_u64().map(|v| Value::Uint32(v as u32)).ok_or_else(type_err),
        LogicalType::Uint64 => json.as_u64().map(Value::Uint64).ok_or_else(type_err),
        LogicalType::Float => json.as_f64().map(|v| Value::Float(v as f32)).ok_or_else(type_err),
        LogicalType::Double => json.as_f64().map(Value::Double).ok_or_else(type_err),
        LogicalType::String => json.as_str().map(|s| Value::String(s.to_string())).ok_or_else(type_err),
        LogicalType::Bytes => json
            .as_str()
            .and_then(|s| base64_engine().decode(s).ok())
            .map(Value::Bytes)
            .ok_or_else(type_err),
        LogicalType::Message(path) => {
            let nested_schema = registry
                .get(path)
                .ok_or_else(|| RpcError::ServerError { message: Some(format!("unknown schema: {path}")) })?;
            let fields = decode_message(json, &nested_schema, registry)?;
            Ok(Value::Message(fields))
        }
        LogicalType::Repeated(inner) => {
            let arr = json.as_array().ok_or_else(type_err)?;
            let items = arr
                .iter()
                .map(|item| json_to_value(item, inner, registry))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Repeated(items))
        }
        LogicalType::Map(inner) => {
            let obj = json.as_object().ok_or_else(type_err)?;
            let mut entries = BTreeMap::new();
            for (k, v) in obj {
                entries.insert(k.clone(), json_to_value(v, inner, registry)?);
            }
            Ok(Value::Map(entries))
        }
        LogicalType::Timestamp => {
            let obj = json.as_object().ok_or_else(type_err)?;
            let seconds = obj.get("seconds").and_then(Json::as_i64).unwrap_or(0);
            let nanos = obj.get("nanos").and_then(Json::as_i64).unwrap_or(0) as i32;
            Ok(Value::Timestamp { seconds, nanos })
        }
    }
}

fn type_err() -> RpcError {
    RpcError::invalid_field("<field>", "value does not match the declared type")
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{Codec, FieldSchema, OneofBranch};

    fn registry_with(schemas: Vec<Schema>) -> Arc<SchemaRegistry> {
        let registry = Arc::new(SchemaRegistry::new());
        for schema in schemas {
            registry.register(schema);
        }
        registry
    }

    #[test]
    fn empty_bytes_decode_as_empty_object() {
        let schema = Schema::new(
            "test.Note",
            vec![FieldSchema {
                name: "content".into(),
                ty: LogicalType::String,
            }],
        );
        let codec = JsonCodec::new(registry_with(vec![schema.clone()]));
        let decoded = codec.decode(&[], &schema).unwrap();
        match decoded {
            Value::Message(fields) => assert_eq!(fields["content"], Value::String(String::new())),
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn camel_case_flag_transforms_only_schema_owned_keys() {
        let schema = Schema::new(
            "test.CountryInfo",
            vec![FieldSchema {
                name: "country_info_by_id".into(),
                ty: LogicalType::Map(Box::new(LogicalType::String)),
            }],
        )
        .with_camel_case(true);
        let codec = JsonCodec::new(registry_with(vec![schema.clone()]));

        let mut entries = BTreeMap::new();
        entries.insert("not_a_camel_key".into(), Value::String("x".into()));
        let mut fields = BTreeMap::new();
        fields.insert("country_info_by_id".into(), Value::Map(entries));
        let value = Value::Message(fields);

        let bytes = codec.encode(&value, &schema);
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\"countryInfoById\""));
        assert!(text.contains("\"not_a_camel_key\""));

        let decoded = codec.decode(&bytes, &schema).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn oneof_decodes_by_value_shape_not_wrapper() {
        let schema = Schema::new(
            "test.WithOneof",
            vec![FieldSchema {
                name: "bool_or_str".into(),
                ty: LogicalType::Oneof(vec![
                    OneofBranch::new("bool_value", LogicalType::Bool).default_branch(Some(Value::Bool(true))),
                    OneofBranch::new("str_value", LogicalType::String),
                ]),
            }],
        );
        let codec = JsonCodec::new(registry_with(vec![schema.clone()]));

        let bytes = Bytes::from_static(br#"{"bool_or_str": true}"#);
        let decoded = codec.decode(&bytes, &schema).unwrap();
        match decoded {
            Value::Message(fields) => {
                assert_eq!(
                    fields["bool_or_str"],
                    Value::Oneof("bool_value".into(), Box::new(Value::Bool(true)))
                );
            }
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn error_encoding_matches_kind_shape() {
        let codec = JsonCodec::new(Arc::new(SchemaRegistry::new()));
        let bytes = codec.encode_error(&RpcError::NotFound);
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text, r#"{"error":"not found"}"#);

        let bytes = codec.encode_error(&RpcError::invalid_field("name", "required"));
        let json: Json = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["name"], "required");
    }
}
