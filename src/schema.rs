//! Payload validation against the definition's JSON Schema.
//!
//! Validation happens exactly once, at enqueue time. Delivery never
//! re-validates.

use crate::error::{HookError, Result};

/// Validates a payload against a JSON Schema document.
///
/// Implementations must report *all* violations joined into a single
/// error value, not just the first.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema: &serde_json::Value, payload: &[u8]) -> Result<()>;
}

/// Default validator backed by the `jsonschema` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaValidator;

impl JsonSchemaValidator {
    pub fn new() -> Self {
        Self
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, schema: &serde_json::Value, payload: &[u8]) -> Result<()> {
        let compiled = jsonschema::JSONSchema::compile(schema)
            .map_err(|e| HookError::schema(format!("schema does not compile: {e}")))?;

        let instance: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| HookError::schema(format!("payload is not valid JSON: {e}")))?;

        if let Err(violations) = compiled.validate(&instance) {
            let message = violations
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HookError::schema(message));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn valid_payload_passes() {
        let schema = json!({
            "type": "object",
            "properties": { "entity_id": { "type": "string" } },
            "required": ["entity_id"]
        });

        let result = JsonSchemaValidator.validate(&schema, br#"{"entity_id":"example"}"#);
        assert!(result.is_ok());
    }

    #[test]
    fn invalid_payload_rejected() {
        let schema = json!({
            "type": "object",
            "properties": { "entity_id": { "type": "string" } },
            "required": ["entity_id"],
            "additionalProperties": false
        });

        let err = JsonSchemaValidator
            .validate(&schema, br#"{"not_entity_id":"example"}"#)
            .unwrap_err();
        assert!(matches!(err, HookError::Schema { .. }));
    }

    #[test]
    fn all_violations_joined() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": { "type": "string" },
                "b": { "type": "integer" }
            },
            "required": ["a", "b"]
        });

        // Both `a` and `b` are missing; the message must mention both.
        let err = JsonSchemaValidator.validate(&schema, b"{}").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("\"a\""), "message was: {message}");
        assert!(message.contains("\"b\""), "message was: {message}");
    }

    #[test]
    fn non_json_payload_rejected() {
        let schema = json!({ "type": "object" });
        let err = JsonSchemaValidator.validate(&schema, b"not json").unwrap_err();
        assert!(matches!(err, HookError::Schema { .. }));
    }
}
