//! JSON Schema validation for manifests and runtime action I/O.
//!
//! Validators are compiled once (Draft-07 semantics) and cached by schema id.
//! The cache is keyed by id only, never by schema content: callers own id
//! uniqueness, and a second call with the same id reuses the first compiled
//! schema even if a different schema document is passed.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

use jsonschema::{Draft, JSONSchema};
use serde_json::{Value, json};

use crate::types::TrikManifest;

/// Result type alias for trikgate-manifest.
pub type Result<T> = std::result::Result<T, ManifestError>;

/// Errors raised while parsing or validating manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Manifest failed schema validation; carries every error, not just the first
    #[error("invalid manifest: {}", .0.join(", "))]
    Invalid(Vec<String>),

    /// The schema document itself could not be compiled
    #[error("schema compile error: {0}")]
    SchemaCompile(String),
}

/// Result of a validation operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    /// Errors formatted as `"<path>: <message>"`
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self { valid: true, errors: Vec::new() }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self { valid: false, errors }
    }
}

/// Fixed top-level schema every manifest must satisfy.
///
/// Each action must match exactly one of the two response-mode sub-schemas:
/// template mode requires an agent-data schema and response templates,
/// passthrough mode requires a user-content schema.
static MANIFEST_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    let action_template = json!({
        "type": "object",
        "properties": {
            "responseMode": {"type": "string", "const": "template"},
            "inputSchema": {"type": "object"},
            "agentDataSchema": {"type": "object"},
            "userContentSchema": {"type": "object"},
            "responseTemplates": {
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }
            },
            "description": {"type": "string"}
        },
        "required": ["responseMode", "inputSchema", "agentDataSchema", "responseTemplates"]
    });

    let action_passthrough = json!({
        "type": "object",
        "properties": {
            "responseMode": {"type": "string", "const": "passthrough"},
            "inputSchema": {"type": "object"},
            "userContentSchema": {"type": "object"},
            "description": {"type": "string"}
        },
        "required": ["responseMode", "inputSchema", "userContentSchema"]
    });

    json!({
        "type": "object",
        "properties": {
            "id": {"type": "string", "minLength": 1},
            "name": {"type": "string", "minLength": 1},
            "description": {"type": "string"},
            "version": {"type": "string", "pattern": r"^\d+\.\d+\.\d+"},
            "actions": {
                "type": "object",
                "additionalProperties": {"anyOf": [action_template, action_passthrough]},
                "minProperties": 1
            },
            "capabilities": {
                "type": "object",
                "properties": {
                    "tools": {"type": "array", "items": {"type": "string"}},
                    "canRequestClarification": {"type": "boolean"}
                },
                "required": ["tools", "canRequestClarification"]
            },
            "limits": {
                "type": "object",
                "properties": {
                    "maxExecutionTimeMs": {"type": "number", "minimum": 0},
                    "maxLlmCalls": {"type": "number", "minimum": 0},
                    "maxToolCalls": {"type": "number", "minimum": 0}
                },
                "required": ["maxExecutionTimeMs", "maxLlmCalls", "maxToolCalls"]
            },
            "entry": {
                "type": "object",
                "properties": {
                    "module": {"type": "string", "minLength": 1},
                    "export": {"type": "string", "minLength": 1},
                    "runtime": {"type": "string", "enum": ["node", "python"]}
                },
                "required": ["module", "export"]
            },
            "author": {"type": "string"},
            "repository": {"type": "string"},
            "license": {"type": "string"}
        },
        "required": [
            "id", "name", "description", "version",
            "actions", "capabilities", "limits", "entry"
        ]
    })
});

fn compile(schema: &Value) -> Result<JSONSchema> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| ManifestError::SchemaCompile(e.to_string()))
}

fn run_validation(compiled: &JSONSchema, data: &Value) -> ValidationResult {
    match compiled.validate(data) {
        Ok(()) => ValidationResult::valid(),
        Err(errors) => {
            let formatted = errors
                .map(|error| {
                    let pointer = error.instance_path.to_string();
                    let path = if pointer.is_empty() {
                        "root".to_string()
                    } else {
                        pointer.trim_start_matches('/').to_string()
                    };
                    format!("{path}: {error}")
                })
                .collect();
            ValidationResult::invalid(formatted)
        }
    }
}

/// Validate a manifest document against the fixed manifest schema.
pub fn validate_manifest(manifest: &Value) -> Result<ValidationResult> {
    static COMPILED: LazyLock<std::result::Result<JSONSchema, String>> =
        LazyLock::new(|| compile(&MANIFEST_SCHEMA).map_err(|e| e.to_string()));

    match &*COMPILED {
        Ok(compiled) => Ok(run_validation(compiled, manifest)),
        Err(e) => Err(ManifestError::SchemaCompile(e.clone())),
    }
}

/// Validate data against an ad-hoc schema, without caching.
pub fn validate_data(schema: &Value, data: &Value) -> Result<ValidationResult> {
    let compiled = compile(schema)?;
    Ok(run_validation(&compiled, data))
}

/// Parse and validate a manifest document into its typed form.
///
/// Fails loudly: a manifest that does not satisfy the schema is never
/// partially constructed.
pub fn parse_manifest(manifest: &Value) -> Result<TrikManifest> {
    let validation = validate_manifest(manifest)?;
    if !validation.valid {
        return Err(ManifestError::Invalid(validation.errors));
    }
    Ok(serde_json::from_value(manifest.clone())?)
}

/// Validator that compiles and caches one validator per schema id.
#[derive(Default)]
pub struct SchemaValidator {
    cache: Mutex<HashMap<String, Arc<JSONSchema>>>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `data` against the schema registered under `schema_id`.
    ///
    /// The first call with a given id compiles and caches `schema`; later
    /// calls reuse the cached validator regardless of the `schema` argument.
    pub fn validate(&self, schema_id: &str, schema: &Value, data: &Value) -> Result<ValidationResult> {
        let compiled = {
            let mut cache = self.cache.lock().expect("schema cache poisoned");
            match cache.get(schema_id) {
                Some(compiled) => Arc::clone(compiled),
                None => {
                    let compiled = Arc::new(compile(schema)?);
                    cache.insert(schema_id.to_string(), Arc::clone(&compiled));
                    compiled
                }
            }
        };

        Ok(run_validation(&compiled, data))
    }

    /// Drop every cached validator.
    pub fn clear(&self) {
        self.cache.lock().expect("schema cache poisoned").clear();
    }

    /// Number of cached validators.
    pub fn cached_count(&self) -> usize {
        self.cache.lock().expect("schema cache poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_manifest() -> Value {
        json!({
            "id": "@demo/articles",
            "name": "Articles",
            "description": "Search articles",
            "version": "1.0.0",
            "actions": {
                "search": {
                    "responseMode": "template",
                    "inputSchema": {"type": "object"},
                    "agentDataSchema": {"type": "object"},
                    "responseTemplates": {"success": {"text": "Found {{count}}"}}
                },
                "read": {
                    "responseMode": "passthrough",
                    "inputSchema": {"type": "object"},
                    "userContentSchema": {"type": "object"}
                }
            },
            "capabilities": {"tools": [], "canRequestClarification": false},
            "limits": {"maxExecutionTimeMs": 5000, "maxLlmCalls": 2, "maxToolCalls": 4},
            "entry": {"module": "dist/index.js", "export": "graph", "runtime": "node"}
        })
    }

    #[test]
    fn test_valid_manifest_passes() {
        let result = validate_manifest(&valid_manifest()).unwrap();
        assert!(result.valid, "errors: {:?}", result.errors);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_missing_required_fields_are_all_reported() {
        let result = validate_manifest(&json!({"id": "x"})).unwrap();
        assert!(!result.valid);
        // Every missing top-level field is aggregated, not just the first.
        assert!(result.errors.len() >= 2, "errors: {:?}", result.errors);
        assert!(result.errors.iter().all(|e| e.starts_with("root: ")));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut manifest = valid_manifest();
        manifest["version"] = json!("not-semver");
        let result = validate_manifest(&manifest).unwrap();
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.starts_with("version:")));
    }

    #[test]
    fn test_template_action_requires_templates() {
        let mut manifest = valid_manifest();
        manifest["actions"]["search"]
            .as_object_mut()
            .unwrap()
            .remove("responseTemplates");
        let result = validate_manifest(&manifest).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn test_empty_actions_rejected() {
        let mut manifest = valid_manifest();
        manifest["actions"] = json!({});
        let result = validate_manifest(&manifest).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn test_parse_manifest_aggregates_errors() {
        let err = parse_manifest(&json!({"name": "x"})).unwrap_err();
        match err {
            ManifestError::Invalid(errors) => assert!(errors.len() >= 2),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_error_path_formatting() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "number"}},
            "required": ["count"]
        });
        let result = validate_data(&schema, &json!({"count": "three"})).unwrap();
        assert!(!result.valid);
        assert!(result.errors[0].starts_with("count: "), "got {:?}", result.errors);

        let result = validate_data(&schema, &json!("not an object")).unwrap();
        assert!(result.errors[0].starts_with("root: "), "got {:?}", result.errors);
    }

    #[test]
    fn test_cache_is_keyed_by_id_not_content() {
        let validator = SchemaValidator::new();
        let strict = json!({"type": "object", "required": ["a"]});
        let loose = json!({"type": "object"});

        let first = validator.validate("schema", &strict, &json!({})).unwrap();
        assert!(!first.valid);

        // Same id with a different schema still uses the first compiled form.
        let second = validator.validate("schema", &loose, &json!({})).unwrap();
        assert!(!second.valid);
        assert_eq!(validator.cached_count(), 1);

        // A distinct id compiles the loose schema and accepts the data.
        let third = validator.validate("schema-loose", &loose, &json!({})).unwrap();
        assert!(third.valid);
    }

    #[test]
    fn test_cache_clear() {
        let validator = SchemaValidator::new();
        validator
            .validate("s", &json!({"type": "object"}), &json!({}))
            .unwrap();
        assert_eq!(validator.cached_count(), 1);
        validator.clear();
        assert_eq!(validator.cached_count(), 0);
    }

    #[test]
    fn test_invalid_schema_compile_error() {
        let validator = SchemaValidator::new();
        let bad = json!({"type": "no-such-type"});
        let err = validator.validate("bad", &bad, &json!({})).unwrap_err();
        assert!(matches!(err, ManifestError::SchemaCompile(_)));
    }
}
