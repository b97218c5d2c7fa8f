//! Regex-backed guardrail.

use regex::Regex;
use serde::Deserialize;
use steadfast_core::{GuardrailOutcome, Severity, Violation};

use super::{CheckInput, Guardrail};

/// One pattern rule as written in a script or config file.
#[derive(Debug, Clone, Deserialize)]
pub struct PatternRule {
    pub rule: String,
    pub pattern: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_recoverable")]
    pub recoverable: bool,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_severity() -> Severity {
    Severity::Error
}

fn default_recoverable() -> bool {
    true
}

struct CompiledRule {
    rule: PatternRule,
    regex: Regex,
}

/// Flags content matching any of its patterns.
pub struct PatternGuardrail {
    name: String,
    rules: Vec<CompiledRule>,
}

impl PatternGuardrail {
    /// Compile a set of rules. Fails on the first invalid pattern.
    pub fn new(name: impl Into<String>, rules: Vec<PatternRule>) -> Result<Self, regex::Error> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                Regex::new(&rule.pattern).map(|regex| CompiledRule { rule, regex })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.into(),
            rules,
        })
    }
}

impl Guardrail for PatternGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, input: &CheckInput) -> GuardrailOutcome {
        let violations = self
            .rules
            .iter()
            .filter_map(|compiled| {
                let found = compiled.regex.find(&input.content)?;
                let message = compiled
                    .rule
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("matched '{}'", found.as_str()));
                Some(Violation::new(
                    compiled.rule.rule.clone(),
                    compiled.rule.severity,
                    message,
                    compiled.rule.recoverable,
                ))
            })
            .collect();
        GuardrailOutcome::from_violations(violations)
    }
}
