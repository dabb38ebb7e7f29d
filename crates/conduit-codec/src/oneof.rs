//! Best-fit branch matching for `oneof` fields decoded from a wire format
//! that carries no field tag of its own -- i.e. JSON, where `{"bool_or_str":
//! true}` gives no hint other than the value's own shape (§4.3 rule 5).
//! The Binary-IDL codec never needs this: its field tag already identifies
//! the branch.

use conduit_core::{LogicalType, OneofBranch, RpcError, Value};

use crate::schema_registry::SchemaRegistry;
use serde_json::Value as Json;

fn ambiguous() -> RpcError {
    RpcError::ServerError {
        message: Some("ambiguous oneof encoding: value matches more than one branch".to_string()),
    }
}

/// Does `json` structurally fit `ty`? Scalars match by JSON type; a message
/// branch matches when every key present in the JSON object names a field of
/// the candidate schema (a structural stand-in for "match by schema
/// identifier" now that JSON carries no `__path__` tag).
fn json_matches(json: &Json, ty: &LogicalType, registry: &SchemaRegistry) -> bool {
    match (json, ty) {
        (Json::Bool(_), LogicalType::Bool) => true,
        (Json::Number(n), LogicalType::Int32 | LogicalType::Int64) => n.is_i64() || n.is_u64(),
        (Json::Number(n), LogicalType::Uint32 | LogicalType::Uint64) => n.is_u64(),
        (Json::Number(_), LogicalType::Float | LogicalType::Double) => true,
        (Json::String(_), LogicalType::String) => true,
        (Json::String(_), LogicalType::Bytes) => true,
        (Json::Array(_), LogicalType::Repeated(_)) => true,
        (Json::Object(obj), LogicalType::Message(path)) => registry
            .get(path)
            .map(|schema| {
                obj.keys()
                    .all(|key| schema.fields.iter().any(|f| &schema.wire_key(&f.name) == key))
            })
            .unwrap_or(false),
        (Json::Object(_), LogicalType::Timestamp) => true,
        (Json::Object(_), LogicalType::Map(_)) => true,
        _ => false,
    }
}

/// Find the one branch `json` fits. Zero matches is a decode error; more
/// than one is the ambiguous-encoding failure from rule 5b.
pub fn best_fit_for_json<'a>(
    branches: &'a [OneofBranch],
    json: &Json,
    registry: &SchemaRegistry,
) -> Result<&'a OneofBranch, RpcError> {
    let mut matches = branches.iter().filter(|b| json_matches(json, &b.ty, registry));
    let first = matches.next();
    if matches.next().is_some() {
        return Err(ambiguous());
    }
    first.ok_or_else(|| RpcError::invalid_field("<oneof>", "value does not match any declared branch"))
}

/// The same best-fit matching applied to an already-decoded [`Value`],
/// needed when re-encoding a oneof whose active branch was not recorded
/// (e.g. application code built a bare `Value` without naming a branch).
/// Most call sites already carry a branch name in `Value::Oneof` and never
/// need this.
pub fn best_fit_for_value<'a>(branches: &'a [OneofBranch], value: &Value) -> Result<&'a OneofBranch, RpcError> {
    fn value_matches(value: &Value, ty: &LogicalType) -> bool {
        matches!(
            (value, ty),
            (Value::Bool(_), LogicalType::Bool)
                | (Value::Int32(_), LogicalType::Int32)
                | (Value::Int64(_), LogicalType::Int64)
                | (Value::Uint32(_), LogicalType::Uint32)
                | (Value::Uint64(_), LogicalType::Uint64)
                | (Value::Float(_), LogicalType::Float)
                | (Value::Double(_), LogicalType::Double)
                | (Value::String(_), LogicalType::String)
                | (Value::Bytes(_), LogicalType::Bytes)
                | (Value::Message(_), LogicalType::Message(_))
                | (Value::Timestamp { .. }, LogicalType::Timestamp)
        )
    }

    let mut matches = branches.iter().filter(|b| value_matches(value, &b.ty));
    let first = matches.next();
    if matches.next().is_some() {
        return Err(ambiguous());
    }
    first.ok_or_else(|| RpcError::invalid_field("<oneof>", "value does not match any declared branch"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::OneofBranch;

    #[test]
    fn scalar_branches_match_by_json_type() {
        let branches = vec![
            OneofBranch::new("bool_value", LogicalType::Bool),
            OneofBranch::new("str_value", LogicalType::String),
        ];
        let registry = SchemaRegistry::new();
        let branch = best_fit_for_json(&branches, &Json::Bool(true), &registry).unwrap();
        assert_eq!(branch.name, "bool_value");
    }

    #[test]
    fn two_scalar_branches_sharing_a_primitive_are_ambiguous() {
        let branches = vec![
            OneofBranch::new("a", LogicalType::String),
            OneofBranch::new("b", LogicalType::String),
        ];
        let registry = SchemaRegistry::new();
        let err = best_fit_for_json(&branches, &Json::String("x".into()), &registry).unwrap_err();
        match err {
            RpcError::ServerError { message } => assert!(message.unwrap().contains("ambiguous")),
            other => panic!("expected ServerError, got {other:?}"),
        }
    }
}
