//! Structural schema tree and the recursive validator.
//!
//! Supports the practical JSON-Schema subset used by AMTP payloads:
//! `object` (with `required` and `properties`), `array` (with `items`),
//! `string`, `number`, `integer` and `boolean`. Other keywords are kept
//! for round-tripping but not enforced.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Declared type of a schema node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    /// Key/value mapping
    Object,
    /// Ordered sequence
    Array,
    /// UTF-8 string
    String,
    /// Any JSON number
    Number,
    /// Number without a fractional part
    Integer,
    /// true/false
    Boolean,
}

impl SchemaKind {
    /// JSON-Schema name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Object, Value::Object(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            // By representation: 3.0 parses as a float and is rejected.
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Boolean, Value::Bool(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One node of a schema definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaNode {
    /// Declared type; an untyped node accepts any value
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SchemaKind>,
    /// Property names an object must carry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Nested schemas for object properties
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SchemaNode>,
    /// Schema for every array element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaNode>>,
    /// Keywords outside the supported subset
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single place where a payload departs from its schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Dot/bracket path from the payload root; empty for the root itself
    pub path: String,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "<root>: {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

impl SchemaNode {
    /// Create a bare node of the given kind
    pub fn new(kind: SchemaKind) -> Self {
        Self {
            kind: Some(kind),
            required: Vec::new(),
            properties: BTreeMap::new(),
            items: None,
            extra: Map::new(),
        }
    }

    /// Parse a node tree from a JSON schema definition
    pub fn from_value(def: &Value) -> Result<Self, serde_json::Error> {
        SchemaNode::deserialize(def)
    }

    /// Return the first violation found, if any
    pub fn first_violation(&self, value: &Value) -> Option<SchemaViolation> {
        let mut found = Vec::new();
        let _ = self.walk(value, &mut String::new(), &mut found, true);
        found.into_iter().next()
    }

    /// Return every violation found in one full descent, in visit order
    pub fn violations(&self, value: &Value) -> Vec<SchemaViolation> {
        let mut found = Vec::new();
        let _ = self.walk(value, &mut String::new(), &mut found, false);
        found
    }

    fn walk(
        &self,
        value: &Value,
        path: &mut String,
        found: &mut Vec<SchemaViolation>,
        fail_fast: bool,
    ) -> ControlFlow<()> {
        let Some(kind) = self.kind else {
            return ControlFlow::Continue(());
        };

        if !kind.admits(value) {
            found.push(SchemaViolation {
                path: path.clone(),
                message: format!("expected {}, got {}", kind, value_kind(value)),
            });
            return stop_if(fail_fast);
        }

        match value {
            Value::Object(map) => {
                for name in &self.required {
                    if !map.contains_key(name) {
                        found.push(SchemaViolation {
                            path: join_key(path, name),
                            message: format!("missing required property '{name}'"),
                        });
                        stop_if(fail_fast)?;
                    }
                }

                for (name, child) in &self.properties {
                    if let Some(field) = map.get(name) {
                        let mark = path.len();
                        push_key(path, name);
                        let flow = child.walk(field, path, found, fail_fast);
                        path.truncate(mark);
                        flow?;
                    }
                }
            }
            Value::Array(elements) => {
                if let Some(items) = &self.items {
                    for (index, element) in elements.iter().enumerate() {
                        let mark = path.len();
                        path.push_str(&format!("[{index}]"));
                        let flow = items.walk(element, path, found, fail_fast);
                        path.truncate(mark);
                        flow?;
                    }
                }
            }
            _ => {}
        }

        ControlFlow::Continue(())
    }
}

fn stop_if(fail_fast: bool) -> ControlFlow<()> {
    if fail_fast {
        ControlFlow::Break(())
    } else {
        ControlFlow::Continue(())
    }
}

fn push_key(path: &mut String, key: &str) {
    if !path.is_empty() {
        path.push('.');
    }
    path.push_str(key);
}

fn join_key(path: &str, key: &str) -> String {
    let mut joined = path.to_string();
    push_key(&mut joined, key);
    joined
}

/// Name of a JSON value's runtime kind, as used in violation messages
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair_schema() -> SchemaNode {
        SchemaNode::from_value(&json!({
            "type": "object",
            "required": ["a", "b"],
            "properties": {
                "a": {"type": "string"},
                "b": {"type": "integer"}
            }
        }))
        .unwrap()
    }

    fn line_items_schema() -> SchemaNode {
        SchemaNode::from_value(&json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["sku", "quantity"],
                        "properties": {
                            "sku": {"type": "string"},
                            "quantity": {"type": "integer"}
                        }
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_pair() {
        assert!(pair_schema().first_violation(&json!({"a": "x", "b": 5})).is_none());
    }

    #[test]
    fn test_fractional_integer_rejected() {
        let v = pair_schema()
            .first_violation(&json!({"a": "x", "b": 5.5}))
            .unwrap();
        assert_eq!(v.path, "b");
        assert_eq!(v.message, "expected integer, got number");
    }

    #[test]
    fn test_float_with_zero_fraction_is_not_integer() {
        let v = pair_schema()
            .first_violation(&json!({"a": "x", "b": 3.0}))
            .unwrap();
        assert_eq!(v.path, "b");
    }

    #[test]
    fn test_missing_required() {
        let v = pair_schema().first_violation(&json!({"b": 5})).unwrap();
        assert_eq!(v.path, "a");
        assert!(v.message.contains("missing required property"));
    }

    #[test]
    fn test_extra_properties_allowed() {
        let payload = json!({"a": "x", "b": 1, "c": [1, 2, 3]});
        assert!(pair_schema().first_violation(&payload).is_none());
    }

    #[test]
    fn test_root_type_mismatch() {
        let v = pair_schema().first_violation(&json!([1, 2])).unwrap();
        assert_eq!(v.path, "");
        assert_eq!(v.to_string(), "<root>: expected object, got array");
    }

    #[test]
    fn test_array_elements_checked_independently() {
        let schema = line_items_schema();
        let payload = json!({"items": [
            {"sku": "A", "quantity": 1},
            {"sku": "B", "quantity": "two"},
            {"quantity": 3}
        ]});

        let first = schema.first_violation(&payload).unwrap();
        assert_eq!(first.path, "items[1].quantity");

        let all = schema.violations(&payload);
        let paths: Vec<&str> = all.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["items[1].quantity", "items[2].sku"]);
    }

    #[test]
    fn test_detailed_collects_across_properties() {
        let all = pair_schema().violations(&json!({"b": "five"}));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path, "a");
        assert_eq!(all[1].path, "b");
    }

    #[test]
    fn test_boolean_and_number_kinds() {
        let node = SchemaNode::new(SchemaKind::Boolean);
        assert!(node.first_violation(&json!(true)).is_none());
        assert!(node.first_violation(&json!(1)).is_some());

        let node = SchemaNode::new(SchemaKind::Number);
        assert!(node.first_violation(&json!(1)).is_none());
        assert!(node.first_violation(&json!(1.5)).is_none());
        assert!(node.first_violation(&json!("1")).is_some());
    }

    #[test]
    fn test_unknown_keywords_preserved() {
        let def = json!({"type": "string", "enum": ["low", "high"]});
        let node = SchemaNode::from_value(&def).unwrap();
        assert_eq!(serde_json::to_value(&node).unwrap(), def);
        // enum is carried but not enforced
        assert!(node.first_violation(&json!("medium")).is_none());
    }

    #[test]
    fn test_unsupported_type_rejected() {
        assert!(SchemaNode::from_value(&json!({"type": "null"})).is_err());
        assert!(SchemaNode::from_value(&json!({
            "type": "object",
            "properties": {"tags": {"type": "set"}}
        }))
        .is_err());
    }

    #[test]
    fn test_untyped_node_accepts_anything() {
        let def = json!({
            "type": "object",
            "required": ["metadata"],
            "properties": {
                "metadata": {"description": "free-form"},
                "tags": {"type": "array", "items": {}}
            }
        });
        let node = SchemaNode::from_value(&def).unwrap();
        assert_eq!(node.properties["metadata"].kind, None);
        assert_eq!(serde_json::to_value(&node).unwrap(), def);

        for metadata in [json!("text"), json!(7), json!(null), json!({"k": [1]})] {
            let payload = json!({"metadata": metadata, "tags": [1, "two", false]});
            assert!(node.first_violation(&payload).is_none());
        }

        // Still required, even though any value goes
        let v = node.first_violation(&json!({"tags": []})).unwrap();
        assert_eq!(v.path, "metadata");
    }
}
