//! Named, versioned schema definitions.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node::{SchemaNode, SchemaViolation};
use crate::error::{AmtpError, Result};

lazy_static! {
    /// `namespace:category.subcategory.vN`
    static ref SCHEMA_ID: Option<Regex> =
        Regex::new(r"^[a-zA-Z0-9_-]+:[a-zA-Z0-9_.-]+\.v\d+$").ok();
}

/// A schema payloads can be validated against
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    id: String,
    name: String,
    version: String,
    root: SchemaNode,
    description: Option<String>,
}

/// Wire form of a schema
#[derive(Serialize, Deserialize)]
struct SchemaDocument {
    id: String,
    name: String,
    version: String,
    schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl Schema {
    /// Create a schema, checking the id format and the definition tree.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        schema_def: &Value,
    ) -> Result<Self> {
        let id = id.into();
        validate_schema_id(&id)?;

        if !schema_def.is_object() {
            return Err(AmtpError::Validation(
                "Schema definition must be an object".to_string(),
            ));
        }

        let root = SchemaNode::from_value(schema_def)
            .map_err(|e| AmtpError::Validation(format!("Invalid schema definition: {e}")))?;
        // Nested nodes may be untyped, the root may not
        if root.kind.is_none() {
            return Err(AmtpError::Validation(
                "Schema definition must have a 'type' field".to_string(),
            ));
        }

        Ok(Self {
            id,
            name: name.into(),
            version: version.into(),
            root,
            description: None,
        })
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Schema ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version label
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Description, if any
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Root of the definition tree
    pub fn root(&self) -> &SchemaNode {
        &self.root
    }

    /// Validate a payload, failing on the first violation
    pub fn validate(&self, payload: &Value) -> Result<()> {
        match self.root.first_violation(payload) {
            Some(violation) => Err(AmtpError::SchemaValidation(violation)),
            None => Ok(()),
        }
    }

    /// Collect every violation in a payload
    pub fn validate_detailed(&self, payload: &Value) -> Vec<SchemaViolation> {
        self.root.violations(payload)
    }

    /// Convert to the `{id, name, version, schema, description}` form
    pub fn to_transport(&self) -> Result<Value> {
        let doc = SchemaDocument {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            schema: serde_json::to_value(&self.root)?,
            description: self.description.clone(),
        };
        Ok(serde_json::to_value(doc)?)
    }

    /// Parse the `{id, name, version, schema, description}` form
    pub fn from_transport(value: &Value) -> Result<Self> {
        let doc = SchemaDocument::deserialize(value)?;
        let schema = Schema::new(doc.id, doc.name, doc.version, &doc.schema)?;
        Ok(match doc.description {
            Some(d) => schema.with_description(d),
            None => schema,
        })
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_transport()?)?)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_transport(&value)
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Schema({})", self.id)
    }
}

/// Check a schema id against `namespace:category.subcategory.vN`
pub fn validate_schema_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(AmtpError::Validation("Schema ID cannot be empty".to_string()));
    }
    if !SCHEMA_ID.as_ref().is_some_and(|re| re.is_match(id)) {
        return Err(AmtpError::Validation(format!(
            "Invalid schema ID format: {id}. Expected format: 'namespace:category.subcategory.vN'"
        )));
    }
    Ok(())
}

/// Match a schema id against a supported-schema pattern.
///
/// A pattern is an exact id, `*`, or a prefix ending in `*`
/// (`agntcy:commerce.*`).
pub fn schema_pattern_matches(pattern: &str, id: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => id.starts_with(prefix),
        None => pattern == id,
    }
}
