//! Field-level payload schemas.
//!
//! A [`Schema`] maps top-level field names to a [`FieldSchema`]. Payloads are
//! checked through their JSON form, so any serializable payload type can be
//! validated against the same rules:
//!
//! - required fields must be present and non-null
//! - a present field must match its declared [`FieldType`]
//! - `object` fields recurse into their nested schema
//! - `array` fields check every element against the item type
//!
//! # Example
//!
//! ```ignore
//! let schema = Schema::new()
//!     .field("total", FieldSchema::required(FieldType::Number))
//!     .field("note", FieldSchema::optional(FieldType::String));
//!
//! schema.validate(&json!({"total": 10}))?;
//! ```

mod validate;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use validate::validate_payload;

/// Declared type of a field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object(Schema),
    Array(Box<FieldType>),
    /// Any non-null value.
    Any,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object(_) => "object",
            FieldType::Array(_) => "array",
            FieldType::Any => "any",
        }
    }
}

/// Rule for a single field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

impl FieldSchema {
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
        }
    }

    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
        }
    }
}

/// Field name to rule. An empty schema accepts any payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub fields: BTreeMap<String, FieldSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, rule: FieldSchema) -> Self {
        self.fields.insert(name.into(), rule);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validate a JSON payload against this schema.
    pub fn validate(&self, payload: &serde_json::Value) -> crate::Result<()> {
        validate_payload(self, payload)
    }
}
