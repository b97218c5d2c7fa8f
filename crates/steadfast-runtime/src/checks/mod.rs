//! Guardrail and drift check contracts, and their scheduling.
//!
//! Check bodies are supplied by the caller. This module only decides when
//! to run them and where: small content is checked inline before the next
//! token is pulled, larger content is handed to a separate task so token
//! delivery never waits on a heavy check.

use std::sync::Arc;
use steadfast_core::{CheckPolicy, DriftOutcome, GuardrailOutcome};
use tokio::task::JoinSet;

mod pattern;

pub use pattern::{PatternGuardrail, PatternRule};

/// What a check sees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckInput {
    /// Everything accumulated so far in this attempt
    pub content: String,

    /// Content added since the previous check of the same kind
    pub delta: String,

    /// Whether the stream has ended
    pub completed: bool,
}

/// A content rule evaluated against accumulated or incremental content.
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, input: &CheckInput) -> GuardrailOutcome;
}

/// Heuristic detector for output that wandered off course.
pub trait DriftDetector: Send + Sync {
    fn check(&self, content: &str, delta: Option<&str>) -> DriftOutcome;
}

/// Several guardrails evaluated together.
#[derive(Clone, Default)]
pub struct GuardrailSet {
    guardrails: Vec<Arc<dyn Guardrail>>,
}

impl GuardrailSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, guardrail: Arc<dyn Guardrail>) {
        self.guardrails.push(guardrail);
    }

    pub fn is_empty(&self) -> bool {
        self.guardrails.is_empty()
    }

    pub fn len(&self) -> usize {
        self.guardrails.len()
    }

    /// Run every guardrail and merge the outcomes.
    pub fn check(&self, input: &CheckInput) -> GuardrailOutcome {
        self.guardrails
            .iter()
            .map(|g| g.check(input))
            .fold(GuardrailOutcome::default(), GuardrailOutcome::merge)
    }
}

impl std::fmt::Debug for GuardrailSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.guardrails.iter().map(|g| g.name()).collect();
        f.debug_struct("GuardrailSet").field("guardrails", &names).finish()
    }
}

/// Result of one check run.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckReport {
    Guardrail {
        token_count: u64,
        outcome: GuardrailOutcome,
    },
    Drift {
        token_count: u64,
        outcome: DriftOutcome,
    },
}

/// Which checks are due at a given token count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Due {
    pub guardrail: bool,
    pub drift: bool,
}

impl Due {
    pub fn any(self) -> bool {
        self.guardrail || self.drift
    }
}

/// Schedules checks for the running attempt.
pub struct CheckScheduler {
    guardrails: Arc<GuardrailSet>,
    drift: Option<Arc<dyn DriftDetector>>,
    policy: CheckPolicy,
    pending: JoinSet<CheckReport>,
    guardrail_mark: usize,
    drift_mark: usize,
}

impl CheckScheduler {
    pub fn new(
        guardrails: Arc<GuardrailSet>,
        drift: Option<Arc<dyn DriftDetector>>,
        policy: CheckPolicy,
    ) -> Self {
        Self {
            guardrails,
            drift,
            policy,
            pending: JoinSet::new(),
            guardrail_mark: 0,
            drift_mark: 0,
        }
    }

    /// Forget deltas from a previous attempt and drop its deferred checks.
    ///
    /// `content_len` is the length of the content the new attempt starts
    /// with (non-zero when resuming from a checkpoint).
    pub fn reset(&mut self, content_len: usize) {
        self.pending.abort_all();
        self.guardrail_mark = content_len;
        self.drift_mark = content_len;
    }

    /// Which checks the cadence calls for after `token_count` tokens.
    pub fn due(&self, token_count: u64) -> Due {
        Due {
            guardrail: !self.guardrails.is_empty()
                && token_count % self.policy.guardrail_interval.max(1) == 0,
            drift: self.drift.is_some() && token_count % self.policy.drift_interval.max(1) == 0,
        }
    }

    /// Whether a run over this much content happens inline.
    pub fn runs_inline(&self, content: &str) -> bool {
        content.len() <= self.policy.inline_threshold_bytes
    }

    /// Run the due checks.
    ///
    /// Returns reports for checks that ran inline. Deferred checks report
    /// later through [`next_deferred`](Self::next_deferred).
    pub fn run(&mut self, content: &str, token_count: u64, due: Due) -> Vec<CheckReport> {
        let mut reports = Vec::new();
        let inline = self.runs_inline(content);

        if due.guardrail {
            let input = CheckInput {
                content: content.to_string(),
                delta: delta_since(content, self.guardrail_mark),
                completed: false,
            };
            self.guardrail_mark = content.len();
            let guardrails = Arc::clone(&self.guardrails);
            let job = move || CheckReport::Guardrail {
                token_count,
                outcome: guardrails.check(&input),
            };
            if inline {
                reports.push(job());
            } else {
                self.defer(job);
            }
        }

        if due.drift {
            if let Some(detector) = self.drift.clone() {
                let content = content.to_string();
                let delta = delta_since(&content, self.drift_mark);
                self.drift_mark = content.len();
                let job = move || CheckReport::Drift {
                    token_count,
                    outcome: detector.check(&content, Some(&delta)),
                };
                if inline {
                    reports.push(job());
                } else {
                    self.defer(job);
                }
            }
        }

        reports
    }

    /// Final pass once the stream has ended. Always inline.
    pub fn run_final(&mut self, content: &str, token_count: u64) -> Vec<CheckReport> {
        let mut reports = Vec::new();
        if !self.guardrails.is_empty() {
            let input = CheckInput {
                content: content.to_string(),
                delta: delta_since(content, self.guardrail_mark),
                completed: true,
            };
            reports.push(CheckReport::Guardrail {
                token_count,
                outcome: self.guardrails.check(&input),
            });
        }
        if let Some(detector) = &self.drift {
            reports.push(CheckReport::Drift {
                token_count,
                outcome: detector.check(content, None),
            });
        }
        self.guardrail_mark = content.len();
        self.drift_mark = content.len();
        reports
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Wait for the next deferred check to finish.
    ///
    /// Returns `None` when nothing is pending. A check that panicked or was
    /// cancelled is skipped.
    pub async fn next_deferred(&mut self) -> Option<CheckReport> {
        while let Some(joined) = self.pending.join_next().await {
            match joined {
                Ok(report) => return Some(report),
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::warn!(error = %e, "Deferred check failed"),
            }
        }
        None
    }

    fn defer<F>(&mut self, job: F)
    where
        F: FnOnce() -> CheckReport + Send + 'static,
    {
        self.pending.spawn(async move {
            // Run on a later scheduling turn than the token that triggered it
            tokio::task::yield_now().await;
            job()
        });
    }
}

fn delta_since(content: &str, mark: usize) -> String {
    content.get(mark..).unwrap_or(content).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use steadfast_core::{Severity, Violation};

    struct ForbidWord(&'static str);

    impl Guardrail for ForbidWord {
        fn name(&self) -> &str {
            "forbid"
        }

        fn check(&self, input: &CheckInput) -> GuardrailOutcome {
            let violations = if input.content.contains(self.0) {
                vec![Violation::new("forbid", Severity::Error, self.0, true)]
            } else {
                Vec::new()
            };
            GuardrailOutcome::from_violations(violations)
        }
    }

    struct NeverDrifts;

    impl DriftDetector for NeverDrifts {
        fn check(&self, _content: &str, _delta: Option<&str>) -> DriftOutcome {
            DriftOutcome::none()
        }
    }

    fn scheduler(threshold: usize) -> CheckScheduler {
        let mut set = GuardrailSet::new();
        set.push(Arc::new(ForbidWord("bad")));
        let policy = CheckPolicy {
            guardrail_interval: 2,
            drift_interval: 3,
            inline_threshold_bytes: threshold,
            detect_zero_output: true,
        };
        CheckScheduler::new(Arc::new(set), Some(Arc::new(NeverDrifts)), policy)
    }

    #[test]
    fn test_guardrail_set_merges() {
        let mut set = GuardrailSet::new();
        set.push(Arc::new(ForbidWord("x")));
        set.push(Arc::new(ForbidWord("y")));
        let outcome = set.check(&CheckInput {
            content: "x and y".to_string(),
            ..Default::default()
        });
        assert_eq!(outcome.violations.len(), 2);
        assert!(outcome.should_retry);
    }

    #[tokio::test]
    async fn test_cadence() {
        let checks = scheduler(1024);
        assert_eq!(checks.due(1), Due::default());
        assert!(checks.due(2).guardrail && !checks.due(2).drift);
        assert!(checks.due(6).guardrail && checks.due(6).drift);
    }

    #[tokio::test]
    async fn test_small_content_runs_inline() {
        let mut checks = scheduler(1024);
        let reports = checks.run("a bad word", 2, checks.due(2));
        assert_eq!(reports.len(), 1);
        assert!(!checks.has_pending());
        match &reports[0] {
            CheckReport::Guardrail { outcome, .. } => assert!(outcome.is_failure()),
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_large_content_is_deferred() {
        let mut checks = scheduler(4);
        let reports = checks.run("a bad word", 6, checks.due(6));
        assert!(reports.is_empty());
        assert!(checks.has_pending());

        let mut seen = Vec::new();
        while let Some(report) = checks.next_deferred().await {
            seen.push(report);
        }
        assert_eq!(seen.len(), 2);
        assert!(!checks.has_pending());
    }

    #[tokio::test]
    async fn test_reset_drops_pending() {
        let mut checks = scheduler(0);
        checks.run("content", 2, checks.due(2));
        assert!(checks.has_pending());
        checks.reset(0);
        assert_eq!(checks.next_deferred().await, None);
    }

    #[test]
    fn test_delta_tracks_previous_check() {
        assert_eq!(delta_since("hello world", 6), "world");
        assert_eq!(delta_since("short", 99), "short");
    }
}
