//! Schema lookup table shared by both codecs, keyed by schema path
//! (`<package>.<Name>`), built once at server start and read on every
//! decode/encode thereafter (§5: "immutable after start").

use std::collections::HashMap;

use conduit_core::Schema;
use parking_lot::RwLock;

#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema under its own path, so nested-message and map-entry
    /// fields that reference it by name can be resolved during (de)coding.
    pub fn register(&self, schema: Schema) {
        self.schemas.write().insert(schema.name.clone(), schema);
    }

    pub fn get(&self, path: &str) -> Option<Schema> {
        self.schemas.read().get(path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::FieldSchema;
    use conduit_core::LogicalType;

    #[test]
    fn registers_and_resolves_by_path() {
        let registry = SchemaRegistry::new();
        registry.register(Schema::new(
            "pkg.Inner",
            vec![FieldSchema {
                name: "id".into(),
                ty: LogicalType::Int32,
            }],
        ));
        assert!(registry.get("pkg.Inner").is_some());
        assert!(registry.get("pkg.Missing").is_none());
    }
}
