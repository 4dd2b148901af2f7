//! JSON Schema for a provider manifest, checked before the YAML is
//! deserialized into domain types so malformed manifests fail with a
//! readable error instead of a confusing serde type mismatch.

use std::sync::OnceLock;

use jsonschema::Validator;
use serde_json::json;

fn schema() -> &'static Validator {
    static SCHEMA: OnceLock<Validator> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        let schema = json!({
            "type": "object",
            "required": ["name", "capabilities", "workflows"],
            "properties": {
                "name": { "type": "string", "minLength": 1 },
                "capabilities": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["resource_type", "operations"],
                        "properties": {
                            "resource_type": { "type": "string", "minLength": 1 },
                            "alias_for": { "type": ["string", "null"] },
                            "operations": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "required": ["operation"],
                                    "properties": {
                                        "operation": {
                                            "enum": ["create", "update", "delete"]
                                        },
                                        "workflow": { "type": ["string", "null"] },
                                        "workflows": { "type": "array" },
                                        "default": { "type": ["string", "null"] }
                                    }
                                }
                            }
                        }
                    }
                },
                "workflows": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["name", "file", "category", "operation"],
                        "properties": {
                            "name": { "type": "string", "minLength": 1 },
                            "file": { "type": "string", "minLength": 1 },
                            "category": {
                                "enum": ["provisioner", "goldenpath"]
                            },
                            "operation": {
                                "enum": ["create", "update", "delete"]
                            },
                            "tags": { "type": "array", "items": { "type": "string" } }
                        }
                    }
                }
            }
        });
        jsonschema::validator_for(&schema).expect("manifest schema is valid JSON Schema")
    })
}

/// Validates a parsed manifest document (already loaded as YAML, passed
/// through as `serde_json::Value` since YAML documents round-trip
/// structurally identical to JSON for our purposes) against the manifest
/// schema. Returns a joined list of the schema validator's own error
/// messages on failure.
pub(super) fn validate_manifest_schema(value: &serde_yml::Value) -> Result<(), String> {
    let as_json: serde_json::Value =
        serde_json::to_value(value).map_err(|e| format!("manifest is not representable as JSON: {e}"))?;

    let errors: Vec<String> = schema()
        .iter_errors(&as_json)
        .map(|e| format!("{e} (at {})", e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
