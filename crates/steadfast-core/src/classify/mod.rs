//! Failure classification.
//!
//! Classification is an explicit, ordered list of predicate → kind rules.
//! Rules are evaluated in fixed priority and the first match wins; a
//! failure no rule claims is [`FailureKind::Unknown`] (model category).
//!
//! Priority matters where wording overlaps: TLS failures look like
//! network failures but are fatal, so the TLS rule runs before any
//! network rule. Status codes run before wording so a `503` that happens
//! to mention "connection" is still a server error.

pub mod patterns;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::StreamError;
use patterns::*;

/// Broad failure category. Drives which retry budget is charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transport-layer failure; retried without a per-category bound
    Network,
    /// Rate limit, 5xx, timeouts; retried without a per-category bound
    Transient,
    /// Bad or missing output; charged against the bounded attempts budget
    Model,
    /// Never retried
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Model => "model",
            ErrorCategory::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Retry allow-list key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    ZeroOutput,
    GuardrailViolation,
    Drift,
    Incomplete,
    Malformed,
    NetworkError,
    Timeout,
    RateLimit,
    ServerError,
    Unknown,
}

impl RetryReason {
    /// Reasons retried when a policy does not list its own.
    pub fn defaults() -> Vec<RetryReason> {
        vec![
            RetryReason::ZeroOutput,
            RetryReason::GuardrailViolation,
            RetryReason::Drift,
            RetryReason::Incomplete,
            RetryReason::Malformed,
            RetryReason::NetworkError,
            RetryReason::Timeout,
            RetryReason::RateLimit,
            RetryReason::ServerError,
        ]
    }
}

/// Fine-grained failure kind, the output of a matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    // Fatal
    Tls,
    Auth,
    InvalidRequest,
    GuardrailHalt,

    // Transient
    RateLimited,
    ServerError,
    RequestTimeout,
    InitialTokenTimeout,
    InterTokenTimeout,

    // Network
    ConnectionDropped,
    FetchFailed,
    ConnectionReset,
    ConnectionRefused,
    StreamAborted,
    NoBytes,
    PartialChunks,
    RuntimeKilled,
    BackgroundThrottle,
    Dns,
    NetworkTimeout,
    Network,

    // Model
    GuardrailViolation,
    Drift,
    ZeroOutput,
    Incomplete,
    Malformed,
    Unknown,
}

impl FailureKind {
    pub fn category(self) -> ErrorCategory {
        use FailureKind::*;
        match self {
            Tls | Auth | InvalidRequest | GuardrailHalt => ErrorCategory::Fatal,
            RateLimited | ServerError | RequestTimeout | InitialTokenTimeout
            | InterTokenTimeout => ErrorCategory::Transient,
            ConnectionDropped | FetchFailed | ConnectionReset | ConnectionRefused
            | StreamAborted | NoBytes | PartialChunks | RuntimeKilled | BackgroundThrottle
            | Dns | NetworkTimeout | Network => ErrorCategory::Network,
            GuardrailViolation | Drift | ZeroOutput | Incomplete | Malformed | Unknown => {
                ErrorCategory::Model
            }
        }
    }

    pub fn retry_reason(self) -> RetryReason {
        use FailureKind::*;
        match self {
            RateLimited => RetryReason::RateLimit,
            ServerError => RetryReason::ServerError,
            RequestTimeout | InitialTokenTimeout | InterTokenTimeout => RetryReason::Timeout,
            ConnectionDropped | FetchFailed | ConnectionReset | ConnectionRefused
            | StreamAborted | NoBytes | PartialChunks | RuntimeKilled | BackgroundThrottle
            | Dns | NetworkTimeout | Network | Tls => RetryReason::NetworkError,
            GuardrailViolation | GuardrailHalt => RetryReason::GuardrailViolation,
            Drift => RetryReason::Drift,
            ZeroOutput => RetryReason::ZeroOutput,
            Incomplete => RetryReason::Incomplete,
            Malformed => RetryReason::Malformed,
            Auth | InvalidRequest | Unknown => RetryReason::Unknown,
        }
    }
}

/// Result of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: FailureKind,
    pub category: ErrorCategory,
    pub reason: RetryReason,
}

impl From<FailureKind> for Classification {
    fn from(kind: FailureKind) -> Self {
        Self {
            kind,
            category: kind.category(),
            reason: kind.retry_reason(),
        }
    }
}

/// One predicate → kind rule.
#[derive(Clone, Copy)]
pub struct ClassificationRule {
    pub kind: FailureKind,
    pub matches: fn(&StreamError) -> bool,
}

impl ClassificationRule {
    pub const fn new(kind: FailureKind, matches: fn(&StreamError) -> bool) -> Self {
        Self { kind, matches }
    }
}

impl fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Ordered rule table mapping failures to kinds.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl ErrorClassifier {
    /// Create a classifier with the built-in rule table.
    pub fn new() -> Self {
        Self {
            rules: default_rules(),
        }
    }

    /// Create a classifier with an explicit rule table.
    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// Insert a rule ahead of every existing rule.
    pub fn prepend(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Classify a failure. Pure: the same error always yields the same result.
    pub fn classify(&self, error: &StreamError) -> Classification {
        self.rules
            .iter()
            .find(|rule| (rule.matches)(error))
            .map(|rule| Classification::from(rule.kind))
            .unwrap_or_else(|| Classification::from(FailureKind::Unknown))
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn status(error: &StreamError) -> Option<u16> {
    match error {
        StreamError::Source { status, .. } => *status,
        _ => None,
    }
}

fn source_matches(error: &StreamError, pattern: &Regex) -> bool {
    match error {
        StreamError::Source { message, code, .. } => {
            pattern.is_match(message) || code.as_deref().is_some_and(|c| pattern.is_match(c))
        }
        _ => false,
    }
}

fn default_rules() -> Vec<ClassificationRule> {
    use FailureKind as K;
    vec![
        // Fatal lookalikes first
        ClassificationRule::new(K::Tls, |e| source_matches(e, &TLS_PATTERN)),
        ClassificationRule::new(K::Auth, |e| {
            matches!(status(e), Some(401 | 403)) || source_matches(e, &AUTH_PATTERN)
        }),
        ClassificationRule::new(K::GuardrailHalt, |e| match e {
            StreamError::GuardrailViolation { violations } => {
                violations.iter().any(|v| v.forces_halt())
            }
            _ => false,
        }),
        // Status-driven transient
        ClassificationRule::new(K::RateLimited, |e| {
            status(e) == Some(429) || source_matches(e, &RATE_LIMIT_PATTERN)
        }),
        ClassificationRule::new(K::ServerError, |e| {
            matches!(status(e), Some(500..=599))
        }),
        ClassificationRule::new(K::RequestTimeout, |e| {
            status(e) == Some(408) || source_matches(e, &REQUEST_TIMEOUT_PATTERN)
        }),
        ClassificationRule::new(K::InitialTokenTimeout, |e| {
            matches!(e, StreamError::InitialTokenTimeout { .. })
        }),
        ClassificationRule::new(K::InterTokenTimeout, |e| {
            matches!(e, StreamError::InterTokenTimeout { .. })
        }),
        ClassificationRule::new(K::InvalidRequest, |e| {
            matches!(status(e), Some(400..=499))
        }),
        // Network, specific before generic
        ClassificationRule::new(K::ConnectionReset, |e| {
            source_matches(e, &CONNECTION_RESET_PATTERN)
        }),
        ClassificationRule::new(K::ConnectionRefused, |e| {
            source_matches(e, &CONNECTION_REFUSED_PATTERN)
        }),
        ClassificationRule::new(K::StreamAborted, |e| {
            source_matches(e, &STREAM_ABORTED_PATTERN)
        }),
        ClassificationRule::new(K::ConnectionDropped, |e| {
            source_matches(e, &CONNECTION_DROPPED_PATTERN)
        }),
        ClassificationRule::new(K::FetchFailed, |e| source_matches(e, &FETCH_FAILED_PATTERN)),
        ClassificationRule::new(K::NoBytes, |e| source_matches(e, &NO_BYTES_PATTERN)),
        ClassificationRule::new(K::PartialChunks, |e| {
            source_matches(e, &PARTIAL_CHUNKS_PATTERN)
        }),
        ClassificationRule::new(K::RuntimeKilled, |e| {
            source_matches(e, &RUNTIME_KILLED_PATTERN)
        }),
        ClassificationRule::new(K::BackgroundThrottle, |e| {
            source_matches(e, &BACKGROUND_THROTTLE_PATTERN)
        }),
        ClassificationRule::new(K::Dns, |e| source_matches(e, &DNS_PATTERN)),
        ClassificationRule::new(K::NetworkTimeout, |e| {
            source_matches(e, &NETWORK_TIMEOUT_PATTERN)
        }),
        ClassificationRule::new(K::Network, |e| source_matches(e, &NETWORK_GENERIC_PATTERN)),
        // Model
        ClassificationRule::new(K::GuardrailViolation, |e| {
            matches!(e, StreamError::GuardrailViolation { .. })
        }),
        ClassificationRule::new(K::Drift, |e| matches!(e, StreamError::Drift { .. })),
        ClassificationRule::new(K::ZeroOutput, |e| matches!(e, StreamError::ZeroOutput)),
        ClassificationRule::new(K::Incomplete, |e| {
            matches!(e, StreamError::Incomplete { .. })
        }),
        ClassificationRule::new(K::Malformed, |e| matches!(e, StreamError::Malformed { .. })),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, Violation};
    use proptest::prelude::*;
    use std::time::Duration;

    fn classify(error: StreamError) -> Classification {
        ErrorClassifier::new().classify(&error)
    }

    #[test]
    fn test_tls_is_fatal_despite_network_wording() {
        let c = classify(StreamError::source(
            "network error: certificate has expired",
        ));
        assert_eq!(c.kind, FailureKind::Tls);
        assert_eq!(c.category, ErrorCategory::Fatal);
    }

    #[test]
    fn test_network_kinds() {
        assert_eq!(
            classify(StreamError::with_code("read failed", "ECONNRESET")).kind,
            FailureKind::ConnectionReset
        );
        assert_eq!(
            classify(StreamError::source("getaddrinfo ENOTFOUND api.example.com")).kind,
            FailureKind::Dns
        );
        assert_eq!(
            classify(StreamError::source("socket hang up")).category,
            ErrorCategory::Network
        );
        assert_eq!(
            classify(StreamError::source("network is unreachable")).kind,
            FailureKind::Network
        );
    }

    #[test]
    fn test_message_and_code_match_separately() {
        // "connection" + "reset" only reads as a reset when joined
        let c = classify(StreamError::with_code("upstream closed the connection", "reset"));
        assert_eq!(c.kind, FailureKind::Network);

        let c = classify(StreamError::with_code("upstream went away", "ECONNREFUSED"));
        assert_eq!(c.kind, FailureKind::ConnectionRefused);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            classify(StreamError::with_status("slow down", 429)).kind,
            FailureKind::RateLimited
        );
        assert_eq!(
            classify(StreamError::with_status("connection to upstream failed", 503)).kind,
            FailureKind::ServerError
        );
        assert_eq!(
            classify(StreamError::with_status("nope", 401)).category,
            ErrorCategory::Fatal
        );
        assert_eq!(
            classify(StreamError::with_status("bad schema", 422)).kind,
            FailureKind::InvalidRequest
        );
        assert_eq!(
            classify(StreamError::with_status("took too long", 408)).category,
            ErrorCategory::Transient
        );
    }

    #[test]
    fn test_watchdog_timeouts_are_transient() {
        let c = classify(StreamError::InterTokenTimeout {
            timeout: Duration::from_millis(500),
        });
        assert_eq!(c.category, ErrorCategory::Transient);
        assert_eq!(c.reason, RetryReason::Timeout);
    }

    #[test]
    fn test_guardrail_severity_split() {
        let recoverable = classify(StreamError::GuardrailViolation {
            violations: vec![Violation::new("fmt", Severity::Error, "bad", true)],
        });
        assert_eq!(recoverable.category, ErrorCategory::Model);
        assert_eq!(recoverable.reason, RetryReason::GuardrailViolation);

        let fatal = classify(StreamError::GuardrailViolation {
            violations: vec![Violation::new("pii", Severity::Fatal, "leak", false)],
        });
        assert_eq!(fatal.kind, FailureKind::GuardrailHalt);
        assert_eq!(fatal.category, ErrorCategory::Fatal);
    }

    #[test]
    fn test_model_fallthrough() {
        assert_eq!(classify(StreamError::ZeroOutput).category, ErrorCategory::Model);
        assert_eq!(
            classify(StreamError::source("the model said something odd")).kind,
            FailureKind::Unknown
        );
    }

    #[test]
    fn test_prepended_rule_wins() {
        let classifier = ErrorClassifier::new().prepend(ClassificationRule::new(
            FailureKind::RateLimited,
            |e| matches!(e, StreamError::Source { message, .. } if message.contains("busy")),
        ));
        let c = classifier.classify(&StreamError::source("connection busy"));
        assert_eq!(c.kind, FailureKind::RateLimited);
    }

    proptest! {
        #[test]
        fn prop_classification_is_deterministic(
            message in ".{0,64}",
            status in proptest::option::of(100u16..600),
        ) {
            let classifier = ErrorClassifier::new();
            let error = StreamError::Source { message, status, code: None };
            prop_assert_eq!(classifier.classify(&error), classifier.classify(&error));
        }

        #[test]
        fn prop_category_matches_kind(message in "[a-zA-Z ]{0,40}") {
            let c = ErrorClassifier::new().classify(&StreamError::source(message));
            prop_assert_eq!(c.category, c.kind.category());
            prop_assert_eq!(c.reason, c.kind.retry_reason());
        }
    }
}
