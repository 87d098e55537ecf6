//! Schema registration and payload validation.
//!
//! Schemas are named, versioned structural contracts a message payload can
//! claim to follow via its `schema` field.
//!
//! # Schema IDs
//!
//! | Part        | Example        | Rule                    |
//! |-------------|----------------|-------------------------|
//! | namespace   | `agntcy`       | `[a-zA-Z0-9_-]+`        |
//! | category    | `commerce`     | `[a-zA-Z0-9_.-]+`       |
//! | subcategory | `order`        | (part of the above)     |
//! | version     | `v1`           | `v` followed by digits  |
//!
//! # Supported Definition Subset
//!
//! | `type`    | Extra keywords checked      |
//! |-----------|-----------------------------|
//! | `object`  | `required`, `properties`    |
//! | `array`   | `items`                     |
//! | `string`  | -                           |
//! | `number`  | -                           |
//! | `integer` | (fraction-free numbers only)|
//! | `boolean` | -                           |
//!
//! Objects are open: properties not listed under `properties` are allowed.
//!
//! # Usage
//!
//! ```rust,ignore
//! use amtp::schema::{Schema, SchemaRegistry};
//!
//! let registry = SchemaRegistry::new();
//! registry.register(Schema::new("agntcy:commerce.order.v1", "Order", "v1", &def)?);
//!
//! // Fail on the first problem
//! registry.validate("agntcy:commerce.order.v1", &payload)?;
//!
//! // Or collect them all
//! for v in registry.validate_detailed("agntcy:commerce.order.v1", &payload)? {
//!     println!("{v}");
//! }
//! ```

mod definition;
mod node;
mod registry;

pub use definition::{schema_pattern_matches, validate_schema_id, Schema};
pub use node::{value_kind, SchemaKind, SchemaNode, SchemaViolation};
pub use registry::SchemaRegistry;
