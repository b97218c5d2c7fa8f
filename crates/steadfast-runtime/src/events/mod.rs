//! Lifecycle event taxonomy.
//!
//! Every event shares `{type, ts, session_id, context}`; the remaining
//! fields depend on the event type. Events are immutable once built.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use steadfast_core::{
    ErrorCategory, FailureKind, RecoveryStrategy, RetryCounters, RetryReason, SessionState,
    Severity,
};

mod bus;

pub use bus::{BatchConfig, BusConfig, EventBus, EventHandler, HandlerError};

/// Caller context attached to every event. Copied once per session.
pub type EventContext = Arc<BTreeMap<String, serde_json::Value>>;

/// One emitted lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Microseconds since the bus was created; strictly increasing
    pub ts: u64,
    pub session_id: Arc<str>,
    pub context: EventContext,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// The wire name of this event, e.g. `SESSION_START`.
    pub fn event_type(&self) -> &'static str {
        self.kind.name()
    }
}

/// Which watchdog an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    InitialToken,
    InterToken,
}

/// Why a retry that would otherwise have happened was not taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    /// Model-category retries reached `attempts`
    AttemptsExhausted,
    /// Total retries reached `max_retries`
    MaxRetriesReached,
    /// The veto declined (or failed)
    Vetoed,
}

/// Event payloads, tagged by type.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    SessionStart {
        attempt: u32,
        is_retry: bool,
        is_fallback: bool,
    },
    AttemptStart {
        attempt: u32,
        source_index: usize,
        source: String,
        is_retry: bool,
        is_fallback: bool,
    },
    StreamInit {
        attempt: u32,
        source_index: usize,
        source: String,
    },
    StreamReady {
        attempt: u32,
        source_index: usize,
    },
    AdapterMessage {
        value: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    TimeoutStart {
        timeout_type: TimeoutKind,
        timeout_ms: u64,
    },
    TimeoutReset {
        token_count: u64,
    },
    TimeoutTriggered {
        timeout_type: TimeoutKind,
        timeout_ms: u64,
        token_count: u64,
    },
    CheckpointSaved {
        token_count: u64,
        content_length: usize,
    },
    GuardrailPhaseStart {
        token_count: u64,
        completed: bool,
        deferred: bool,
    },
    GuardrailRuleResult {
        rule: String,
        severity: Severity,
        message: String,
        recoverable: bool,
    },
    GuardrailPhaseEnd {
        token_count: u64,
        violations: usize,
        should_halt: bool,
        should_retry: bool,
    },
    DriftCheckStart {
        token_count: u64,
        deferred: bool,
    },
    DriftCheckResult {
        token_count: u64,
        detected: bool,
        types: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },
    Error {
        failure_type: FailureKind,
        category: ErrorCategory,
        reason: RetryReason,
        recovery_strategy: RecoveryStrategy,
        message: String,
        attempt: u32,
        source_index: usize,
    },
    RetryStart {
        attempt: u32,
    },
    RetryAttempt {
        attempt: u32,
        category: ErrorCategory,
        delay_ms: u64,
        counters: RetryCounters,
    },
    RetryEnd {
        retries: u32,
        counters: RetryCounters,
    },
    RetryGiveUp {
        category: ErrorCategory,
        reason: GiveUpReason,
        counters: RetryCounters,
    },
    FallbackStart {
        from_index: usize,
        to_index: usize,
    },
    FallbackModelSelected {
        index: usize,
        source: String,
    },
    FallbackEnd {
        index: usize,
    },
    ContinuationStart {
        checkpoint_tokens: u64,
        checkpoint_length: usize,
    },
    ResumeStart {
        checkpoint_tokens: u64,
        checkpoint_length: usize,
    },
    ResumeEnd {
        overlap_chars: usize,
    },
    AbortRequested,
    AbortCompleted {
        token_count: u64,
        content_length: usize,
    },
    Complete {
        state: Box<SessionState>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::SessionStart { .. } => "SESSION_START",
            EventKind::AttemptStart { .. } => "ATTEMPT_START",
            EventKind::StreamInit { .. } => "STREAM_INIT",
            EventKind::StreamReady { .. } => "STREAM_READY",
            EventKind::AdapterMessage { .. } => "ADAPTER_MESSAGE",
            EventKind::TimeoutStart { .. } => "TIMEOUT_START",
            EventKind::TimeoutReset { .. } => "TIMEOUT_RESET",
            EventKind::TimeoutTriggered { .. } => "TIMEOUT_TRIGGERED",
            EventKind::CheckpointSaved { .. } => "CHECKPOINT_SAVED",
            EventKind::GuardrailPhaseStart { .. } => "GUARDRAIL_PHASE_START",
            EventKind::GuardrailRuleResult { .. } => "GUARDRAIL_RULE_RESULT",
            EventKind::GuardrailPhaseEnd { .. } => "GUARDRAIL_PHASE_END",
            EventKind::DriftCheckStart { .. } => "DRIFT_CHECK_START",
            EventKind::DriftCheckResult { .. } => "DRIFT_CHECK_RESULT",
            EventKind::Error { .. } => "ERROR",
            EventKind::RetryStart { .. } => "RETRY_START",
            EventKind::RetryAttempt { .. } => "RETRY_ATTEMPT",
            EventKind::RetryEnd { .. } => "RETRY_END",
            EventKind::RetryGiveUp { .. } => "RETRY_GIVE_UP",
            EventKind::FallbackStart { .. } => "FALLBACK_START",
            EventKind::FallbackModelSelected { .. } => "FALLBACK_MODEL_SELECTED",
            EventKind::FallbackEnd { .. } => "FALLBACK_END",
            EventKind::ContinuationStart { .. } => "CONTINUATION_START",
            EventKind::ResumeStart { .. } => "RESUME_START",
            EventKind::ResumeEnd { .. } => "RESUME_END",
            EventKind::AbortRequested => "ABORT_REQUESTED",
            EventKind::AbortCompleted { .. } => "ABORT_COMPLETED",
            EventKind::Complete { .. } => "COMPLETE",
        }
    }

    /// Whether this event ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::Complete { .. } | EventKind::AbortCompleted { .. })
    }
}
