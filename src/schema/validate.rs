//! Schema validation over JSON values.

use super::{FieldType, Schema};
use crate::error::{Result, StoreError};
use serde_json::Value;

/// Validate `payload` against `schema`, reporting the first failing field path.
pub fn validate_payload(schema: &Schema, payload: &Value) -> Result<()> {
    if schema.is_empty() {
        return Ok(());
    }
    validate_object(schema, payload, "")
}

fn validate_object(schema: &Schema, value: &Value, path: &str) -> Result<()> {
    let object = match value {
        Value::Object(map) => map,
        other => {
            let at = if path.is_empty() { "$" } else { path };
            return Err(StoreError::schema(
                at,
                format!("expected object, got {}", json_type(other)),
            ));
        }
    };

    for (name, rule) in &schema.fields {
        let field_path = join(path, name);
        match object.get(name) {
            None | Some(Value::Null) => {
                if rule.required {
                    return Err(StoreError::schema(field_path, "required field is missing"));
                }
            }
            Some(field) => validate_type(&rule.field_type, field, &field_path)?,
        }
    }

    Ok(())
}

fn validate_type(expected: &FieldType, value: &Value, path: &str) -> Result<()> {
    let matches = match (expected, value) {
        (FieldType::Any, Value::Null) => false,
        (FieldType::Any, _) => true,
        (FieldType::String, Value::String(_)) => true,
        (FieldType::Number, Value::Number(_)) => true,
        (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
        (FieldType::Boolean, Value::Bool(_)) => true,
        (FieldType::Object(nested), Value::Object(_)) => {
            return validate_object(nested, value, path);
        }
        (FieldType::Array(item), Value::Array(elements)) => {
            for (i, element) in elements.iter().enumerate() {
                validate_type(item, element, &format!("{}[{}]", path, i))?;
            }
            return Ok(());
        }
        _ => false,
    };

    if matches {
        Ok(())
    } else {
        Err(StoreError::schema(
            path,
            format!("expected {}, got {}", expected.name(), json_type(value)),
        ))
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
