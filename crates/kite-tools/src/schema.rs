// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use crate::ToolError;

/// A tool input schema compiled once at registration time.
///
/// Compilation is the expensive step; validation against a compiled
/// schema is cheap enough to run on every call.
pub struct CompiledSchema {
    raw: Value,
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    /// Compile a JSON Schema.  An uncompilable schema is a registration
    /// error, not a call error.
    pub fn compile(schema: Value) -> Result<Self, ToolError> {
        let validator = jsonschema::validator_for(&schema).map_err(|e| ToolError::Schema {
            message: e.to_string(),
        })?;
        Ok(Self {
            raw: schema,
            validator,
        })
    }

    /// The schema as provided at registration.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Validate an input value.  The first violation is reported; the
    /// message names the failing path so the model can self-correct.
    pub fn validate(&self, input: &Value) -> Result<(), ToolError> {
        match self.validator.validate(input) {
            Ok(()) => Ok(()),
            Err(err) => Err(ToolError::InvalidInput {
                message: format!("schema validation failed at {}: {}", err.instance_path, err),
            }),
        }
    }
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema").field("raw", &self.raw).finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"],
            "additionalProperties": false
        })
    }

    #[test]
    fn valid_input_passes() {
        let s = CompiledSchema::compile(echo_schema()).unwrap();
        assert!(s.validate(&json!({"text": "hi"})).is_ok());
    }

    #[test]
    fn wrong_type_rejected_with_message() {
        let s = CompiledSchema::compile(echo_schema()).unwrap();
        let err = s.validate(&json!({"text": 123})).unwrap_err();
        match err {
            ToolError::InvalidInput { message } => {
                assert!(message.contains("schema"), "message was: {message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_rejected() {
        let s = CompiledSchema::compile(echo_schema()).unwrap();
        assert!(s.validate(&json!({})).is_err());
    }

    #[test]
    fn additional_property_rejected() {
        let s = CompiledSchema::compile(echo_schema()).unwrap();
        assert!(s.validate(&json!({"text": "hi", "extra": 1})).is_err());
    }

    #[test]
    fn uncompilable_schema_is_registration_error() {
        let bad = json!({"type": "not-a-real-type"});
        match CompiledSchema::compile(bad) {
            Err(ToolError::Schema { .. }) => {}
            other => panic!("expected Schema error, got {other:?}"),
        }
    }

    #[test]
    fn raw_schema_preserved() {
        let s = CompiledSchema::compile(echo_schema()).unwrap();
        assert_eq!(s.raw()["required"], json!(["text"]));
    }
}
