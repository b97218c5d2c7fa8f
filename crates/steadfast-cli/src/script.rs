//! Scenario files for `steadfast run`.
//!
//! A scenario lists scripted sources (primary first), optional pattern
//! guardrails and caller context:
//!
//! ```yaml
//! context:
//!   tenant: acme
//! guardrails:
//!   - rule: no-secrets
//!     pattern: "(?i)api[_-]?key"
//!     severity: fatal
//!     recoverable: false
//! sources:
//!   - name: primary
//!     attempts:
//!       - - { type: token, value: "Hello" }
//!         - { type: fail, message: "connection reset by peer" }
//!       - - { type: token, value: "Hello, world" }
//!   - name: backup
//!     attempts:
//!       - - { type: token, value: "Hi" }
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use steadfast_runtime::{PatternGuardrail, PatternRule, ScriptStep, ScriptedSource};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub guardrails: Vec<PatternRule>,

    pub sources: Vec<SourceScript>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceScript {
    pub name: String,

    /// One step list per attempt; the last is replayed once exhausted
    pub attempts: Vec<Vec<ScriptStep>>,
}

impl Script {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let script: Script = serde_yaml::from_str(yaml).context("Failed to parse scenario")?;
        if script.sources.is_empty() {
            bail!("Scenario must declare at least one source");
        }
        Ok(script)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_yaml(&contents)
    }

    /// Build the sources in declaration order.
    pub fn sources(&self) -> Vec<Arc<ScriptedSource>> {
        self.sources
            .iter()
            .map(|source| {
                source
                    .attempts
                    .iter()
                    .cloned()
                    .fold(ScriptedSource::new(source.name.as_str()), ScriptedSource::attempt)
            })
            .map(Arc::new)
            .collect()
    }

    /// Compile the guardrail rules, if any.
    pub fn guardrail(&self) -> Result<Option<PatternGuardrail>> {
        if self.guardrails.is_empty() {
            return Ok(None);
        }
        let guardrail = PatternGuardrail::new("scenario", self.guardrails.clone())
            .context("Invalid guardrail pattern")?;
        Ok(Some(guardrail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
context:
  tenant: acme
guardrails:
  - rule: no-secrets
    pattern: "(?i)api[_-]?key"
    severity: fatal
sources:
  - name: primary
    attempts:
      - - { type: token, value: "Hello" }
        - { type: delay, duration: 250ms }
        - { type: fail, message: "connection reset by peer" }
      - - { type: token, value: "Hello, world" }
  - name: backup
    attempts:
      - - { type: token, value: "Hi" }
"#;

    #[test]
    fn test_parse_scenario() {
        let script = Script::from_yaml(SCENARIO).unwrap();
        assert_eq!(script.sources.len(), 2);
        assert_eq!(script.sources[0].attempts.len(), 2);
        assert_eq!(
            script.sources[0].attempts[0][1],
            ScriptStep::delay(std::time::Duration::from_millis(250))
        );
        assert_eq!(script.context.get("tenant"), Some(&serde_json::json!("acme")));
        assert!(script.guardrail().unwrap().is_some());
    }

    #[test]
    fn test_empty_sources_rejected() {
        assert!(Script::from_yaml("sources: []").is_err());
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let yaml = r#"
guardrails:
  - rule: broken
    pattern: "(unclosed"
sources:
  - name: p
    attempts: [[{ type: done }]]
"#;
        let script = Script::from_yaml(yaml).unwrap();
        assert!(script.guardrail().is_err());
    }
}
