//! Session orchestrator: the attempt loop.
//!
//! The orchestrator implements:
//! - One attempt at a time against the source at the current index
//! - Retry on the same source, fallback to the next, or halt
//! - Optional resume from the last known-good checkpoint
//! - An ordered, observable lifecycle on the event bus
//!
//! Every failure is reported with `ERROR` before its action (wait or
//! source switch) runs. A session ends with exactly one of `COMPLETE` or a
//! returned error.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use steadfast_core::{
    Checkpoint, ContinuationBuilder, ErrorClassifier, OverlapDeduplicator, RecoveryStrategy,
    SessionPolicy, SessionState, VerbatimContinuation,
};

use crate::attempt::{AttemptOutcome, AttemptRunner};
use crate::checks::{CheckInput, CheckScheduler, DriftDetector, Guardrail, GuardrailSet};
use crate::events::{BusConfig, EventBus, EventHandler, EventKind};
use crate::resilience::{RetryDecisionEngine, RetryVeto, SourceChain};
use crate::sources::{SourceFactory, SourceRequest};
use crate::stream::{Delivery, SessionStream};
use crate::SessionError;

/// Cancels a running session.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Request cancellation. Honored at the next suspension point.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Runs one session across its sources.
pub struct SessionOrchestrator {
    session_id: String,
    sources: SourceChain,
    policy: SessionPolicy,
    context: BTreeMap<String, serde_json::Value>,
    classifier: ErrorClassifier,
    guardrails: Arc<GuardrailSet>,
    drift: Option<Arc<dyn DriftDetector>>,
    veto: Option<Arc<dyn RetryVeto>>,
    continuation: Arc<dyn ContinuationBuilder>,
    handlers: Vec<Arc<dyn EventHandler>>,
    bus_config: BusConfig,
    cancel: CancellationToken,
}

/// How the next attempt is entered.
#[derive(Debug, Default)]
struct Entry {
    is_retry: bool,
    is_fallback: bool,
    resume: Option<Checkpoint>,
}

impl SessionOrchestrator {
    pub fn builder() -> SessionOrchestratorBuilder {
        SessionOrchestratorBuilder::new()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.cancel.clone(),
        }
    }

    /// Run the session to the end, handing every delivery to `on_delivery`.
    ///
    /// Returns the final state on completion. On failure the error carries
    /// the state, so partial content is never lost.
    pub async fn run<F>(self, mut on_delivery: F) -> Result<SessionState, SessionError>
    where
        F: FnMut(Delivery) + Send,
    {
        let context = Arc::new(self.context.clone());
        let bus = EventBus::new(
            self.session_id.as_str(),
            context,
            self.handlers.clone(),
            self.bus_config,
        );

        let result = self.drive(&bus, &mut on_delivery).await;
        bus.shutdown().await;
        result
    }

    /// Spawn the session and stream its deliveries.
    pub fn stream(self) -> SessionStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(move |delivery| {
            // Receiver gone means the caller stopped listening; keep running
            let _ = tx.send(delivery);
        }));
        SessionStream::new(rx, task)
    }

    async fn drive(
        &self,
        bus: &EventBus,
        deliver: &mut (dyn FnMut(Delivery) + Send),
    ) -> Result<SessionState, SessionError> {
        let session_id = self.session_id.as_str();
        let mut state = SessionState::new(self.policy.retry.max_error_history);
        let engine = RetryDecisionEngine::new(
            self.classifier.clone(),
            self.policy.retry.clone(),
            self.veto.clone(),
        );
        let mut checks = CheckScheduler::new(
            Arc::clone(&self.guardrails),
            self.drift.clone(),
            self.policy.checks.clone(),
        );

        bus.emit(|| EventKind::SessionStart {
            attempt: 1,
            is_retry: false,
            is_fallback: false,
        });
        info!(session_id, sources = self.sources.len(), "Session started");

        let mut entry = Entry::default();
        let mut retried = false;
        let mut fell_back = false;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.aborted(bus, state));
            }

            let attempt = state.begin_attempt(entry.resume.as_ref());
            checks.reset(state.content.len());
            let source_index = state.source_index;
            let source: &dyn SourceFactory = match self.sources.get(source_index) {
                Some(source) => source.as_ref(),
                None => return Err(SessionError::NoSources),
            };

            bus.emit(|| EventKind::AttemptStart {
                attempt,
                source_index,
                source: source.name().to_string(),
                is_retry: entry.is_retry,
                is_fallback: entry.is_fallback,
            });

            let request = SourceRequest {
                attempt,
                source_index,
                is_retry: entry.is_retry,
                is_fallback: entry.is_fallback,
                continuation: entry.resume.as_ref().map(|c| self.continuation.build(c)),
            };
            let dedup = entry
                .resume
                .take()
                .map(|c| OverlapDeduplicator::new(c.content, self.policy.continuation.min_overlap));

            let runner = AttemptRunner {
                bus,
                policy: &self.policy,
                checks: &mut checks,
                cancel: &self.cancel,
            };
            let outcome = runner.run(source, request, &mut state, dedup, deliver).await;
            checks.reset(0);

            let error = match outcome {
                AttemptOutcome::Completed => {
                    if retried {
                        let counters = state.counters;
                        bus.emit(|| EventKind::RetryEnd {
                            retries: counters.total(),
                            counters,
                        });
                    }
                    if fell_back {
                        bus.emit(|| EventKind::FallbackEnd {
                            index: source_index,
                        });
                    }
                    bus.emit(|| EventKind::Complete {
                        state: Box::new(state.clone()),
                    });
                    info!(
                        session_id,
                        attempt,
                        source_index,
                        tokens = state.token_count,
                        "Session complete"
                    );
                    return Ok(state);
                }
                AttemptOutcome::Aborted => return Err(self.aborted(bus, state)),
                AttemptOutcome::Failed(error) => error,
            };

            let has_fallback = self.sources.has_next(source_index);
            let decision = engine.decide(&error, &mut state, has_fallback).await;
            let classification = decision.classification;

            if let Some(reason) = decision.gave_up {
                let counters = state.counters;
                bus.emit(|| EventKind::RetryGiveUp {
                    category: classification.category,
                    reason,
                    counters,
                });
            }
            bus.emit(|| EventKind::Error {
                failure_type: classification.kind,
                category: classification.category,
                reason: classification.reason,
                recovery_strategy: decision.strategy,
                message: error.to_string(),
                attempt,
                source_index,
            });
            warn!(
                session_id,
                attempt,
                source_index,
                category = %classification.category,
                strategy = %decision.strategy,
                error = %error,
                "Attempt failed"
            );

            match decision.strategy {
                RecoveryStrategy::Retry => {
                    if !retried {
                        retried = true;
                        bus.emit(|| EventKind::RetryStart { attempt });
                    }
                    let delay_ms = decision.delay.as_millis() as u64;
                    let counters = state.counters;
                    bus.emit(|| EventKind::RetryAttempt {
                        attempt: attempt + 1,
                        category: classification.category,
                        delay_ms,
                        counters,
                    });
                    info!(session_id, attempt, delay_ms, category = %classification.category, "Retrying");

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(self.aborted(bus, state)),
                        _ = tokio::time::sleep(decision.delay) => {}
                    }

                    entry = Entry {
                        is_retry: true,
                        is_fallback: false,
                        resume: self.resume_point(bus, &mut state),
                    };
                }
                RecoveryStrategy::Fallback => {
                    let (from_index, to_index) = state.advance_source();
                    fell_back = true;
                    bus.emit(|| EventKind::FallbackStart {
                        from_index,
                        to_index,
                    });
                    bus.emit(|| EventKind::FallbackModelSelected {
                        index: to_index,
                        source: self.sources.name(to_index).to_string(),
                    });
                    info!(session_id, from_index, to_index, "Falling back");

                    entry = Entry {
                        is_retry: false,
                        is_fallback: true,
                        resume: self.resume_point(bus, &mut state),
                    };
                }
                RecoveryStrategy::Halt => {
                    return Err(SessionError::Halted {
                        error,
                        state: Box::new(state),
                    });
                }
            }
        }
    }

    /// The checkpoint the next attempt resumes from, announcing it.
    ///
    /// A snapshot taken between check passes may hold content the checks
    /// never saw; it is re-checked here and discarded if it fails.
    fn resume_point(&self, bus: &EventBus, state: &mut SessionState) -> Option<Checkpoint> {
        if !self.policy.continuation.enabled {
            return None;
        }
        let checkpoint = state.resumable_checkpoint()?;
        if !self.checkpoint_is_clean(&checkpoint) {
            debug!(
                checkpoint_tokens = checkpoint.token_count,
                "Discarding checkpoint that fails checks"
            );
            state.checkpoints.clear();
            return None;
        }
        let checkpoint_tokens = checkpoint.token_count;
        let checkpoint_length = checkpoint.content.len();
        bus.emit(|| EventKind::ContinuationStart {
            checkpoint_tokens,
            checkpoint_length,
        });
        bus.emit(|| EventKind::ResumeStart {
            checkpoint_tokens,
            checkpoint_length,
        });
        Some(checkpoint)
    }

    fn checkpoint_is_clean(&self, checkpoint: &Checkpoint) -> bool {
        let input = CheckInput {
            content: checkpoint.content.clone(),
            delta: String::new(),
            completed: false,
        };
        if self.guardrails.check(&input).is_failure() {
            return false;
        }
        match &self.drift {
            Some(drift) => !drift.check(&checkpoint.content, None).detected,
            None => true,
        }
    }

    fn aborted(&self, bus: &EventBus, mut state: SessionState) -> SessionError {
        state.aborted = true;
        let token_count = state.token_count;
        let content_length = state.content.len();
        bus.emit(|| EventKind::AbortRequested);
        bus.emit(|| EventKind::AbortCompleted {
            token_count,
            content_length,
        });
        info!(session_id = %self.session_id, token_count, "Session aborted");
        SessionError::Aborted {
            state: Box::new(state),
        }
    }
}

/// Builder for SessionOrchestrator.
pub struct SessionOrchestratorBuilder {
    session_id: Option<String>,
    sources: SourceChain,
    policy: SessionPolicy,
    context: BTreeMap<String, serde_json::Value>,
    classifier: ErrorClassifier,
    guardrails: GuardrailSet,
    drift: Option<Arc<dyn DriftDetector>>,
    veto: Option<Arc<dyn RetryVeto>>,
    continuation: Arc<dyn ContinuationBuilder>,
    handlers: Vec<Arc<dyn EventHandler>>,
    bus_config: BusConfig,
}

impl SessionOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            session_id: None,
            sources: SourceChain::new(),
            policy: SessionPolicy::default(),
            context: BTreeMap::new(),
            classifier: ErrorClassifier::new(),
            guardrails: GuardrailSet::new(),
            drift: None,
            veto: None,
            continuation: Arc::new(VerbatimContinuation),
            handlers: Vec::new(),
            bus_config: BusConfig::default(),
        }
    }

    /// Add a source. The first is the primary; later ones are fallbacks in order.
    pub fn source(mut self, source: Arc<dyn SourceFactory>) -> Self {
        self.sources = self.sources.add(source);
        self
    }

    pub fn policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Caller context copied into every event.
    pub fn context(mut self, context: BTreeMap<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    /// Use a caller-supplied session id instead of a random one.
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Replace the classification rule table.
    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.guardrails.push(guardrail);
        self
    }

    pub fn drift_detector(mut self, detector: Arc<dyn DriftDetector>) -> Self {
        self.drift = Some(detector);
        self
    }

    pub fn veto(mut self, veto: Arc<dyn RetryVeto>) -> Self {
        self.veto = Some(veto);
        self
    }

    pub fn continuation_builder(mut self, builder: Arc<dyn ContinuationBuilder>) -> Self {
        self.continuation = builder;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn bus_config(mut self, config: BusConfig) -> Self {
        self.bus_config = config;
        self
    }

    /// Build the orchestrator.
    pub fn build(self) -> Result<SessionOrchestrator, SessionError> {
        if self.sources.is_empty() {
            return Err(SessionError::NoSources);
        }
        self.policy.validate()?;

        Ok(SessionOrchestrator {
            session_id: self
                .session_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            sources: self.sources,
            policy: self.policy,
            context: self.context,
            classifier: self.classifier,
            guardrails: Arc::new(self.guardrails),
            drift: self.drift,
            veto: self.veto,
            continuation: self.continuation,
            handlers: self.handlers,
            bus_config: self.bus_config,
            cancel: CancellationToken::new(),
        })
    }
}

impl Default for SessionOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{ScriptStep, ScriptedSource};

    #[test]
    fn test_build_requires_a_source() {
        let result = SessionOrchestrator::builder().build();
        assert!(matches!(result, Err(SessionError::NoSources)));
    }

    #[test]
    fn test_build_rejects_invalid_policy() {
        let mut policy = SessionPolicy::default();
        policy.checkpoint.interval_tokens = 0;
        let result = SessionOrchestrator::builder()
            .source(Arc::new(ScriptedSource::tokens("p", &["a"])))
            .policy(policy)
            .build();
        assert!(matches!(result, Err(SessionError::Policy(_))));
    }

    #[test]
    fn test_session_id_defaults_to_uuid() {
        let orchestrator = SessionOrchestrator::builder()
            .source(Arc::new(ScriptedSource::tokens("p", &["a"])))
            .build()
            .unwrap();
        assert!(uuid::Uuid::parse_str(orchestrator.session_id()).is_ok());
    }

    #[tokio::test]
    async fn test_run_delivers_tokens() {
        let orchestrator = SessionOrchestrator::builder()
            .source(Arc::new(ScriptedSource::tokens("p", &["Hello", ", ", "world"])))
            .build()
            .unwrap();

        let mut delivered = Vec::new();
        let state = orchestrator
            .run(|d| delivered.extend(d.as_token().map(str::to_string)))
            .await
            .unwrap();

        assert_eq!(delivered, vec!["Hello", ", ", "world"]);
        assert_eq!(state.content, "Hello, world");
        assert_eq!(state.token_count, 3);
        assert!(state.completed);
    }

    #[tokio::test]
    async fn test_stream_then_finish() {
        use futures::StreamExt;

        let orchestrator = SessionOrchestrator::builder()
            .source(Arc::new(
                ScriptedSource::new("p")
                    .attempt(vec![
                        ScriptStep::token("a"),
                        ScriptStep::Message {
                            value: serde_json::json!({"tool": "search"}),
                            role: Some("assistant".to_string()),
                        },
                        ScriptStep::token("b"),
                    ]),
            ))
            .build()
            .unwrap();

        let mut stream = orchestrator.stream();
        let mut deliveries = Vec::new();
        while let Some(delivery) = stream.next().await {
            deliveries.push(delivery);
        }
        assert_eq!(deliveries.len(), 3);
        assert!(matches!(&deliveries[1], Delivery::Message { role: Some(r), .. } if r == "assistant"));

        let state = stream.finish().await.unwrap();
        assert_eq!(state.content, "ab");
    }
}
