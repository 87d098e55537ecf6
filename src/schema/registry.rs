//! Schema registry for lookup and payload validation.
//!
//! The registry is an explicit object: share it behind an `Arc` with every
//! component that needs lookups. Entries live for as long as the registry;
//! registering an id again replaces the previous schema.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use super::definition::Schema;
use super::node::SchemaViolation;
use crate::error::{AmtpError, Result};

/// Concurrent map of schema id to schema
///
/// # Example
/// ```
/// use amtp::schema::{Schema, SchemaRegistry};
/// use serde_json::json;
///
/// let registry = SchemaRegistry::new();
/// let schema = Schema::new(
///     "myapp:message.text.v1",
///     "Text Message",
///     "v1",
///     &json!({
///         "type": "object",
///         "required": ["text"],
///         "properties": {"text": {"type": "string"}}
///     }),
/// )
/// .unwrap();
/// registry.register(schema);
///
/// assert!(registry.validate("myapp:message.text.v1", &json!({"text": "hi"})).is_ok());
/// assert!(registry.validate("myapp:message.text.v1", &json!({})).is_err());
/// ```
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a schema, replacing any previous one with the same id
    pub fn register(&self, schema: Schema) {
        let id = schema.id().to_string();
        let previous = self
            .schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(schema));

        if previous.is_some() {
            tracing::debug!("Schema {} replaced", id);
        } else {
            tracing::debug!("Schema {} registered", id);
        }
    }

    /// Look up a schema by id
    pub fn get(&self, id: &str) -> Option<Arc<Schema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Check if a schema is registered
    pub fn contains(&self, id: &str) -> bool {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// List registered ids, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Number of registered schemas
    pub fn len(&self) -> usize {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate a payload against a registered schema
    pub fn validate(&self, schema_id: &str, payload: &Value) -> Result<()> {
        self.lookup(schema_id)?.validate(payload)
    }

    /// Collect every violation of a payload against a registered schema
    pub fn validate_detailed(
        &self,
        schema_id: &str,
        payload: &Value,
    ) -> Result<Vec<SchemaViolation>> {
        Ok(self.lookup(schema_id)?.validate_detailed(payload))
    }

    fn lookup(&self, schema_id: &str) -> Result<Arc<Schema>> {
        self.get(schema_id)
            .ok_or_else(|| AmtpError::SchemaNotFound(schema_id.to_string()))
    }
}
