//! Retry decision engine.
//!
//! Turns a raw failure into one of retry, fallback or halt. The pure part
//! ([`RetryDecisionEngine::evaluate`]) only reads counters; [`decide`]
//! consults the veto and then charges counters and history.
//!
//! [`decide`]: RetryDecisionEngine::decide

use std::sync::Arc;
use std::time::Duration;

use steadfast_core::{
    Classification, ErrorCategory, ErrorClassifier, ErrorRecord, RecoveryStrategy, RetryCounters,
    RetryPolicy, SessionState, StreamError,
};

use super::veto::{RetryVeto, VetoContext};
use crate::events::GiveUpReason;

/// Policy verdict before the veto and before anything is charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub should_retry: bool,
    pub delay: Duration,
    /// Whether a retry is charged against the bounded model budget
    pub counts_toward_limit: bool,
    /// Set when a limit (rather than the failure itself) blocked the retry
    pub gave_up: Option<GiveUpReason>,
}

/// Outcome of one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub classification: Classification,
    pub strategy: RecoveryStrategy,
    pub delay: Duration,
    pub counts_toward_limit: bool,
    pub gave_up: Option<GiveUpReason>,
}

/// Classifies failures and decides what happens next.
pub struct RetryDecisionEngine {
    classifier: ErrorClassifier,
    policy: RetryPolicy,
    veto: Option<Arc<dyn RetryVeto>>,
}

impl RetryDecisionEngine {
    pub fn new(
        classifier: ErrorClassifier,
        policy: RetryPolicy,
        veto: Option<Arc<dyn RetryVeto>>,
    ) -> Self {
        Self {
            classifier,
            policy,
            veto,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classify(&self, error: &StreamError) -> Classification {
        self.classifier.classify(error)
    }

    /// Apply the policy to a classification, in fixed order:
    /// 1. Fatal never retries
    /// 2. Reasons off the allow-list never retry
    /// 3. The absolute cap blocks every category
    /// 4. The model budget blocks only model retries
    pub fn evaluate(&self, classification: &Classification, counters: &RetryCounters) -> Verdict {
        let counts_toward_limit = classification.category == ErrorCategory::Model;
        let blocked = |gave_up| Verdict {
            should_retry: false,
            delay: Duration::ZERO,
            counts_toward_limit,
            gave_up,
        };

        if classification.category == ErrorCategory::Fatal {
            return blocked(None);
        }
        if !self.policy.allows(classification.reason) {
            return blocked(None);
        }
        if let Some(cap) = self.policy.max_retries {
            if counters.total() >= cap {
                return blocked(Some(GiveUpReason::MaxRetriesReached));
            }
        }
        if counts_toward_limit && counters.model >= self.policy.attempts {
            return blocked(Some(GiveUpReason::AttemptsExhausted));
        }

        let n = counters.for_category(classification.category);
        Verdict {
            should_retry: true,
            delay: self.policy.delay_for(classification, n),
            counts_toward_limit,
            gave_up: None,
        }
    }

    /// Decide what to do about `error` and record the decision in `state`.
    ///
    /// Appends exactly one history record. A retry charges exactly one
    /// counter (the failure's category); fallback and halt charge none.
    pub async fn decide(
        &self,
        error: &StreamError,
        state: &mut SessionState,
        has_fallback: bool,
    ) -> Decision {
        let classification = self.classify(error);
        let mut verdict = self.evaluate(&classification, &state.counters);

        if verdict.should_retry {
            if let Some(veto) = &self.veto {
                let context = VetoContext {
                    error: error.clone(),
                    classification,
                    counters: state.counters,
                    attempt: state.attempt,
                    source_index: state.source_index,
                };
                let allowed = match veto.should_retry(&context).await {
                    Ok(allowed) => allowed,
                    Err(e) => {
                        tracing::warn!(error = %e, "Retry veto failed, not retrying");
                        false
                    }
                };
                if !allowed {
                    verdict.should_retry = false;
                    verdict.delay = Duration::ZERO;
                    verdict.gave_up = Some(GiveUpReason::Vetoed);
                }
            }
        }

        let strategy = if verdict.should_retry {
            RecoveryStrategy::Retry
        } else if has_fallback {
            RecoveryStrategy::Fallback
        } else {
            RecoveryStrategy::Halt
        };

        if strategy == RecoveryStrategy::Retry {
            state.counters.record(classification.category);
        }
        state.error_history.push(ErrorRecord::new(
            &classification,
            error.to_string(),
            state.attempt,
            state.source_index,
            strategy,
        ));

        Decision {
            classification,
            strategy,
            delay: verdict.delay,
            counts_toward_limit: verdict.counts_toward_limit,
            gave_up: verdict.gave_up,
        }
    }
}
