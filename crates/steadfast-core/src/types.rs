//! Shared types for stream failures and content checks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A raw failure observed while streaming.
///
/// Sources report transport failures as [`StreamError::Source`]; the
/// orchestrator synthesizes the other variants (watchdogs, guardrails,
/// drift, empty output). Every variant is classified the same way
/// downstream, so a firing watchdog is indistinguishable from a source
/// error once it reaches the decision engine.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamError {
    #[error("source error: {message}")]
    Source {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },

    #[error("no token received within {timeout:?}")]
    InitialTokenTimeout {
        #[serde(with = "crate::policy::duration_ms")]
        timeout: Duration,
    },

    #[error("no token received for {timeout:?} after the last one")]
    InterTokenTimeout {
        #[serde(with = "crate::policy::duration_ms")]
        timeout: Duration,
    },

    #[error("guardrail violation: {}", summarize(.violations))]
    GuardrailViolation { violations: Vec<Violation> },

    #[error("drift detected: {}", .types.join(", "))]
    Drift {
        types: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },

    #[error("stream produced no meaningful output")]
    ZeroOutput,

    #[error("stream ended before completion: {message}")]
    Incomplete { message: String },

    #[error("malformed output: {message}")]
    Malformed { message: String },
}

impl StreamError {
    /// A source error carrying only a message.
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            status: None,
            code: None,
        }
    }

    /// A source error carrying an HTTP-like status code.
    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self::Source {
            message: message.into(),
            status: Some(status),
            code: None,
        }
    }

    /// A source error carrying a transport error code (e.g. `ECONNRESET`).
    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            status: None,
            code: Some(code.into()),
        }
    }

    /// Whether this failure came from a watchdog rather than the source.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::InitialTokenTimeout { .. } | Self::InterTokenTimeout { .. }
        )
    }
}

fn summarize(violations: &[Violation]) -> String {
    match violations.first() {
        Some(first) if violations.len() > 1 => {
            format!("{} (+{} more)", first, violations.len() - 1)
        }
        Some(first) => first.to_string(),
        None => "no violations".to_string(),
    }
}

/// Severity of a guardrail violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

/// A single guardrail rule violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Rule identifier
    pub rule: String,

    pub severity: Severity,

    /// Human-readable description
    pub message: String,

    /// Whether regenerating could plausibly fix it
    pub recoverable: bool,
}

impl Violation {
    pub fn new(
        rule: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            rule: rule.into(),
            severity,
            message: message.into(),
            recoverable,
        }
    }

    /// Whether this violation fails the attempt at all.
    pub fn is_failure(&self) -> bool {
        self.severity >= Severity::Error
    }

    /// Whether this violation rules out retrying the same source.
    pub fn forces_halt(&self) -> bool {
        self.severity == Severity::Fatal || (self.is_failure() && !self.recoverable)
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

/// Aggregated result of a guardrail pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailOutcome {
    pub violations: Vec<Violation>,
    pub should_halt: bool,
    pub should_retry: bool,
}

impl GuardrailOutcome {
    /// Aggregate violations with strict precedence:
    /// 1. Any fatal or non-recoverable failure → halt
    /// 2. Else any error-level violation → retry
    /// 3. Else (warnings only, or nothing) → continue
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        let should_halt = violations.iter().any(Violation::forces_halt);
        let should_retry = !should_halt && violations.iter().any(Violation::is_failure);
        Self {
            violations,
            should_halt,
            should_retry,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Whether the attempt must stop because of this outcome.
    pub fn is_failure(&self) -> bool {
        self.should_halt || self.should_retry
    }

    /// Merge another outcome into this one, re-aggregating the flags.
    pub fn merge(self, other: GuardrailOutcome) -> Self {
        let mut violations = self.violations;
        violations.extend(other.violations);
        let mut merged = Self::from_violations(violations);
        merged.should_halt |= self.should_halt || other.should_halt;
        merged.should_retry = !merged.should_halt
            && (merged.should_retry || self.should_retry || other.should_retry);
        merged
    }
}

/// Result of a drift check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftOutcome {
    pub detected: bool,

    #[serde(default)]
    pub types: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl DriftOutcome {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn detected(types: Vec<String>, confidence: Option<f64>) -> Self {
        Self {
            detected: true,
            types,
            confidence,
        }
    }
}
