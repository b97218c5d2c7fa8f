//! JSON Schema validation for policy files.
//!
//! Policies are checked against `schema/policy.schema.json` before they are
//! deserialized, so typos in field names are reported instead of silently
//! falling back to defaults.

use std::sync::OnceLock;
use thiserror::Error;

/// Embedded policy schema (loaded at compile time).
const POLICY_SCHEMA_JSON: &str = include_str!("../../schema/policy.schema.json");

/// Compiled validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to load schema: {0}")]
    LoadError(String),
}

fn get_validator() -> Result<&'static jsonschema::Validator, SchemaError> {
    let result = COMPILED_SCHEMA.get_or_init(|| {
        let schema_value: serde_json::Value = serde_json::from_str(POLICY_SCHEMA_JSON)
            .map_err(|e| format!("Invalid schema JSON: {}", e))?;
        jsonschema::options()
            .build(&schema_value)
            .map_err(|e| format!("Failed to compile schema: {}", e))
    });

    result
        .as_ref()
        .map_err(|e| SchemaError::LoadError(e.clone()))
}

/// Validate a policy value against the schema.
///
/// Returns every violation as `"<message> at <path>"`.
pub fn validate_policy_schema(policy: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e.to_string()])?;

    let errors: Vec<String> = validator
        .iter_errors(policy)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// The raw schema text, for tooling that wants to publish it.
pub fn policy_schema() -> &'static str {
    POLICY_SCHEMA_JSON
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schema_compiles() {
        assert!(get_validator().is_ok());
    }

    #[test]
    fn test_valid_policy() {
        let policy = json!({
            "retry": {
                "attempts": 3,
                "backoff": "fixed_jitter",
                "base_delay": "250ms",
                "error_type_delays": { "dns": 2000 },
                "retry_on": ["timeout", "network_error"]
            },
            "continuation": { "enabled": true }
        });
        assert!(validate_policy_schema(&policy).is_ok());
    }

    #[test]
    fn test_rejects_unknown_backoff_and_reason() {
        let policy = json!({
            "retry": { "backoff": "quadratic", "retry_on": ["sometimes"] }
        });
        let errors = validate_policy_schema(&policy).unwrap_err();
        assert!(errors.len() >= 2);
        assert!(errors.iter().any(|e| e.contains("/retry/backoff")));
    }

    #[test]
    fn test_rejects_unknown_failure_kind_key() {
        let policy = json!({ "retry": { "error_type_delays": { "gremlins": 100 } } });
        assert!(validate_policy_schema(&policy).is_err());
    }
}
