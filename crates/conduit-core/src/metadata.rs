//! Transport-agnostic request metadata.
//!
//! The core treats metadata keys as opaque strings supplied by whichever
//! transport accepted the frame (gRPC headers, HTTP headers, bus event
//! payload fields, ...); only the endpoint's declared `meta_keys` give any
//! of them meaning.

use std::collections::BTreeMap;

/// A single metadata value. Transports that only carry strings (HTTP
/// headers) encode `Int`/`Bool` as their string form on the wire and parse
/// them back per the endpoint's declared meta-parameter type.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// The full set of key/value pairs a transport attached to one request.
#[derive(Debug, Clone, Default)]
pub struct Metadata(BTreeMap<String, MetaValue>);

impl Metadata {
    pub fn new() -> Self {
        Metadata(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MetaValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetaValue)> {
        self.0.iter()
    }
}

impl FromIterator<(String, MetaValue)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, MetaValue)>>(iter: I) -> Self {
        Metadata(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_none() {
        let meta = Metadata::new();
        assert!(meta.get("connection-id").is_none());
    }

    #[test]
    fn round_trips_inserted_value() {
        let mut meta = Metadata::new();
        meta.insert("connection-id", MetaValue::Str("abc".into()));
        assert_eq!(meta.get("connection-id"), Some(&MetaValue::Str("abc".into())));
    }
}
