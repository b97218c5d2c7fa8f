//! Session policy parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::duration_ms;
use super::schema::validate_policy_schema;
use crate::backoff::BackoffStrategy;
use crate::classify::{Classification, FailureKind, RetryReason};

/// Errors that can occur when loading a policy.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Failed to read policy file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Policy does not match schema: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Policy validation failed: {0}")]
    ValidationError(String),
}

/// Retry behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Bound on model-category retries
    pub attempts: u32,

    /// Absolute cap across every category (`None` = uncapped)
    pub max_retries: Option<u32>,

    pub backoff: BackoffStrategy,

    #[serde(with = "duration_ms")]
    pub base_delay: Duration,

    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Cap applied to per-error-type delay overrides
    #[serde(with = "duration_ms")]
    pub network_max_delay: Duration,

    /// Per-failure-kind delay overrides, preferred over the backoff formula
    #[serde(with = "duration_ms::map")]
    pub error_type_delays: BTreeMap<FailureKind, Duration>,

    /// Reasons that may be retried at all
    pub retry_on: BTreeSet<RetryReason>,

    /// Size of the error-history ring
    pub max_error_history: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            max_retries: Some(10),
            backoff: BackoffStrategy::FullJitter,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            network_max_delay: Duration::from_secs(30),
            error_type_delays: BTreeMap::new(),
            retry_on: RetryReason::defaults().into_iter().collect(),
            max_error_history: 16,
        }
    }
}

impl RetryPolicy {
    /// Whether a reason is on the allow-list.
    pub fn allows(&self, reason: RetryReason) -> bool {
        self.retry_on.contains(&reason)
    }

    /// Delay before retry `n` of this classification's category.
    pub fn delay_for(&self, classification: &Classification, n: u32) -> Duration {
        match self.error_type_delays.get(&classification.kind) {
            Some(delay) => (*delay).min(self.network_max_delay),
            None => self.backoff.delay(n, self.base_delay, self.max_delay),
        }
    }
}

/// Watchdog timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// Max wait for the first token of an attempt
    #[serde(with = "duration_ms")]
    pub initial_token: Duration,

    /// Max gap between consecutive tokens
    #[serde(with = "duration_ms")]
    pub inter_token: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            initial_token: Duration::from_secs(10),
            inter_token: Duration::from_secs(10),
        }
    }
}

/// Checkpoint cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    pub interval_tokens: u64,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self { interval_tokens: 10 }
    }
}

/// Resume-from-checkpoint behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationPolicy {
    /// Continue from the last known-good token on retry/fallback
    pub enabled: bool,

    /// Shortest splice overlap (in chars) treated as a repetition
    pub min_overlap: usize,
}

impl Default for ContinuationPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            min_overlap: 2,
        }
    }
}

/// Guardrail and drift check cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckPolicy {
    /// Tokens between guardrail passes
    pub guardrail_interval: u64,

    /// Tokens between drift checks
    pub drift_interval: u64,

    /// Content at or below this size is checked inline; larger is deferred
    pub inline_threshold_bytes: usize,

    /// Treat whitespace-only output as a failure
    pub detect_zero_output: bool,
}

impl Default for CheckPolicy {
    fn default() -> Self {
        Self {
            guardrail_interval: 5,
            drift_interval: 10,
            inline_threshold_bytes: 4096,
            detect_zero_output: true,
        }
    }
}

/// Everything configurable about a session that can live in a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    pub retry: RetryPolicy,
    pub timeouts: TimeoutPolicy,
    pub checkpoint: CheckpointPolicy,
    pub continuation: ContinuationPolicy,
    pub checks: CheckPolicy,
}

impl SessionPolicy {
    /// Parse a policy from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_json_value(value)
    }

    /// Parse a policy from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_json_value(value)
    }

    /// Validate against the schema, deserialize, then check semantics.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, PolicyError> {
        // An empty YAML document parses as null
        let value = if value.is_null() {
            serde_json::json!({})
        } else {
            value
        };
        validate_policy_schema(&value).map_err(PolicyError::SchemaError)?;
        let policy: SessionPolicy = serde_json::from_value(value)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Parse a policy file, choosing the format by extension (`.json` or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let policy = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents)?,
            _ => Self::from_yaml(&contents)?,
        };
        debug!(path = %path.display(), "Loaded session policy");
        Ok(policy)
    }

    /// Check relationships the schema cannot express.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let retry = &self.retry;
        if retry.base_delay > retry.max_delay {
            return Err(PolicyError::ValidationError(format!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                retry.base_delay, retry.max_delay
            )));
        }

        if self.checkpoint.interval_tokens == 0 {
            return Err(PolicyError::ValidationError(
                "checkpoint.interval_tokens must be at least 1".to_string(),
            ));
        }

        if self.checks.guardrail_interval == 0 || self.checks.drift_interval == 0 {
            return Err(PolicyError::ValidationError(
                "check intervals must be at least 1".to_string(),
            ));
        }

        if self.timeouts.initial_token.is_zero() || self.timeouts.inter_token.is_zero() {
            return Err(PolicyError::ValidationError(
                "timeouts must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
