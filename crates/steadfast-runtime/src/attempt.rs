//! A single attempt: one source, from open to end or failure.
//!
//! The runner races four things on every turn, in priority order: abort,
//! finished deferred checks, the watchdog, and the next source event. A
//! firing watchdog becomes an ordinary [`StreamError`] so the decision
//! engine cannot tell it apart from a source failure.

use futures::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use steadfast_core::{OverlapDeduplicator, SessionPolicy, SessionState, StreamError};

use crate::checks::{CheckReport, CheckScheduler};
use crate::events::{EventBus, EventKind, TimeoutKind};
use crate::sources::{SourceEvent, SourceFactory, SourceRequest};
use crate::stream::Delivery;

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttemptOutcome {
    Completed,
    Failed(StreamError),
    Aborted,
}

enum Step {
    Report(CheckReport),
    Timeout,
    Event(Option<SourceEvent>),
}

/// Active watchdog.
#[derive(Debug, Clone, Copy)]
struct Watchdog {
    kind: TimeoutKind,
    limit: Duration,
    deadline: Instant,
}

impl Watchdog {
    fn arm(kind: TimeoutKind, limit: Duration) -> Self {
        Self {
            kind,
            limit,
            deadline: Instant::now() + limit,
        }
    }

    fn error(&self) -> StreamError {
        match self.kind {
            TimeoutKind::InitialToken => StreamError::InitialTokenTimeout {
                timeout: self.limit,
            },
            TimeoutKind::InterToken => StreamError::InterTokenTimeout {
                timeout: self.limit,
            },
        }
    }
}

pub(crate) struct AttemptRunner<'a> {
    pub bus: &'a EventBus,
    pub policy: &'a SessionPolicy,
    pub checks: &'a mut CheckScheduler,
    pub cancel: &'a CancellationToken,
}

impl AttemptRunner<'_> {
    /// Drive one attempt to its end.
    ///
    /// `dedup` is set when the attempt resumes from a checkpoint; tokens
    /// pass through it until the splice point is resolved.
    pub async fn run(
        mut self,
        source: &dyn SourceFactory,
        request: SourceRequest,
        state: &mut SessionState,
        mut dedup: Option<OverlapDeduplicator>,
        deliver: &mut (dyn FnMut(Delivery) + Send),
    ) -> AttemptOutcome {
        let attempt = request.attempt;
        let source_index = request.source_index;
        self.bus.emit(|| EventKind::StreamInit {
            attempt,
            source_index,
            source: source.name().to_string(),
        });

        // The initial-token window covers opening the source as well.
        let mut watchdog = Watchdog::arm(
            TimeoutKind::InitialToken,
            self.policy.timeouts.initial_token,
        );
        self.bus.emit(|| EventKind::TimeoutStart {
            timeout_type: watchdog.kind,
            timeout_ms: millis(watchdog.limit),
        });

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return AttemptOutcome::Aborted,
            _ = tokio::time::sleep_until(watchdog.deadline) => {
                return self.timed_out(&watchdog, state);
            }
            opened = source.open(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => return AttemptOutcome::Failed(error),
        };
        self.bus.emit(|| EventKind::StreamReady {
            attempt,
            source_index,
        });

        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return AttemptOutcome::Aborted,
                Some(report) = self.checks.next_deferred(), if self.checks.has_pending() => {
                    Step::Report(report)
                }
                _ = tokio::time::sleep_until(watchdog.deadline) => Step::Timeout,
                event = stream.next() => Step::Event(event),
            };

            match step {
                Step::Report(report) => {
                    if let Some(error) = self.apply(report, state) {
                        return AttemptOutcome::Failed(error);
                    }
                }
                Step::Timeout => return self.timed_out(&watchdog, state),
                Step::Event(Some(SourceEvent::Token { value, .. })) => {
                    let released = match dedup.as_mut() {
                        Some(dedup) if !dedup.is_resolved() => {
                            let released = dedup.push(&value);
                            if dedup.is_resolved() {
                                let overlap_chars = dedup.removed_chars();
                                self.bus.emit(|| EventKind::ResumeEnd { overlap_chars });
                            }
                            released.unwrap_or_default()
                        }
                        _ => value,
                    };

                    state.push_token(&released, std::time::Instant::now());
                    if !released.is_empty() {
                        deliver(Delivery::Token(released));
                    }

                    let token_count = state.token_count;
                    self.bus.emit(|| EventKind::TimeoutReset { token_count });
                    watchdog =
                        Watchdog::arm(TimeoutKind::InterToken, self.policy.timeouts.inter_token);

                    if let Some(error) = self.on_token(state) {
                        return AttemptOutcome::Failed(error);
                    }
                }
                Step::Event(Some(SourceEvent::Message { value, role, .. })) => {
                    self.bus.emit(|| EventKind::AdapterMessage {
                        value: value.clone(),
                        role: role.clone(),
                    });
                    deliver(Delivery::Message { value, role });
                }
                Step::Event(Some(SourceEvent::Error { error, .. })) => {
                    return AttemptOutcome::Failed(error);
                }
                Step::Event(Some(SourceEvent::Done { .. })) | Step::Event(None) => {
                    return self.finish(state, dedup, deliver).await;
                }
            }
        }
    }

    fn timed_out(&self, watchdog: &Watchdog, state: &SessionState) -> AttemptOutcome {
        let token_count = state.token_count;
        self.bus.emit(|| EventKind::TimeoutTriggered {
            timeout_type: watchdog.kind,
            timeout_ms: millis(watchdog.limit),
            token_count,
        });
        warn!(attempt = state.attempt, token_count, timeout = ?watchdog.limit, "Watchdog fired");
        AttemptOutcome::Failed(watchdog.error())
    }

    /// Cadence work after a token: checks first, then a checkpoint if the
    /// content is still known-good.
    fn on_token(&mut self, state: &mut SessionState) -> Option<StreamError> {
        let token_count = state.token_count;
        let due = self.checks.due(token_count);
        if due.any() {
            let deferred = !self.checks.runs_inline(&state.content);
            if due.guardrail {
                self.bus.emit(|| EventKind::GuardrailPhaseStart {
                    token_count,
                    completed: false,
                    deferred,
                });
            }
            if due.drift {
                self.bus
                    .emit(|| EventKind::DriftCheckStart { token_count, deferred });
            }
            for report in self.checks.run(&state.content, token_count, due) {
                if let Some(error) = self.apply(report, state) {
                    return Some(error);
                }
            }
        }

        let interval = self.policy.checkpoint.interval_tokens.max(1);
        let known_good = !self.checks.has_pending()
            && !state.drift_detected
            && !state.violations.iter().any(|v| v.is_failure());
        if self.policy.continuation.enabled && token_count % interval == 0 && known_good {
            let content_length = state.capture_checkpoint().content.len();
            debug!(token_count, content_length, "Checkpoint saved");
            self.bus.emit(|| EventKind::CheckpointSaved {
                token_count,
                content_length,
            });
        }
        None
    }

    /// Natural end of stream: settle the splice, wait for deferred checks,
    /// run the final pass, then check for empty output.
    async fn finish(
        &mut self,
        state: &mut SessionState,
        mut dedup: Option<OverlapDeduplicator>,
        deliver: &mut (dyn FnMut(Delivery) + Send),
    ) -> AttemptOutcome {
        if let Some(dedup) = dedup.as_mut().filter(|d| !d.is_resolved()) {
            if let Some(rest) = dedup.finish() {
                state.content.push_str(&rest);
                deliver(Delivery::Token(rest));
            }
            let overlap_chars = dedup.removed_chars();
            self.bus.emit(|| EventKind::ResumeEnd { overlap_chars });
        }

        while self.checks.has_pending() {
            let report = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return AttemptOutcome::Aborted,
                report = self.checks.next_deferred() => report,
            };
            let Some(report) = report else { break };
            if let Some(error) = self.apply(report, state) {
                return AttemptOutcome::Failed(error);
            }
        }

        let token_count = state.token_count;
        for report in self.checks.run_final(&state.content, token_count) {
            match report {
                CheckReport::Guardrail { .. } => {
                    self.bus.emit(|| EventKind::GuardrailPhaseStart {
                        token_count,
                        completed: true,
                        deferred: false,
                    });
                }
                CheckReport::Drift { .. } => {
                    self.bus.emit(|| EventKind::DriftCheckStart {
                        token_count,
                        deferred: false,
                    });
                }
            }
            if let Some(error) = self.apply(report, state) {
                return AttemptOutcome::Failed(error);
            }
        }

        if self.policy.checks.detect_zero_output && state.is_zero_output() {
            return AttemptOutcome::Failed(StreamError::ZeroOutput);
        }

        state.completed = true;
        AttemptOutcome::Completed
    }

    /// Record a check result. Returns the failure it implies, if any.
    fn apply(&self, report: CheckReport, state: &mut SessionState) -> Option<StreamError> {
        match report {
            CheckReport::Guardrail {
                token_count,
                outcome,
            } => {
                for violation in &outcome.violations {
                    self.bus.emit(|| EventKind::GuardrailRuleResult {
                        rule: violation.rule.clone(),
                        severity: violation.severity,
                        message: violation.message.clone(),
                        recoverable: violation.recoverable,
                    });
                }
                self.bus.emit(|| EventKind::GuardrailPhaseEnd {
                    token_count,
                    violations: outcome.violations.len(),
                    should_halt: outcome.should_halt,
                    should_retry: outcome.should_retry,
                });
                state.violations.extend(outcome.violations.iter().cloned());

                if !outcome.is_failure() {
                    return None;
                }
                debug!(token_count, violations = outcome.violations.len(), "Guardrail failed");
                let violations = outcome
                    .violations
                    .into_iter()
                    .filter(|v| v.is_failure())
                    .collect();
                Some(StreamError::GuardrailViolation { violations })
            }
            CheckReport::Drift {
                token_count,
                outcome,
            } => {
                self.bus.emit(|| EventKind::DriftCheckResult {
                    token_count,
                    detected: outcome.detected,
                    types: outcome.types.clone(),
                    confidence: outcome.confidence,
                });
                if !outcome.detected {
                    return None;
                }
                debug!(token_count, types = ?outcome.types, "Drift detected");
                state.drift_detected = true;
                Some(StreamError::Drift {
                    types: outcome.types,
                    confidence: outcome.confidence,
                })
            }
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
