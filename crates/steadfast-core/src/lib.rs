//! # steadfast-core
//!
//! Deterministic building blocks for resilient token streaming.
//!
//! This crate answers, without ever touching a runtime:
//! - What kind of failure was that?
//! - How long should we wait before trying again?
//! - Where can a resumed stream pick up from?
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: classification is an ordered rule table, first match wins
//! 2. **Monotone**: retry counters and the source cursor never decrease
//! 3. **Bounded**: the error history evicts its oldest entries past a fixed size
//! 4. **Splice-safe**: resumed output never repeats the checkpoint tail
//!
//! ## Example
//!
//! ```rust,ignore
//! use steadfast_core::{ErrorClassifier, SessionPolicy, StreamError};
//!
//! let policy = SessionPolicy::from_file("policy.yaml")?;
//! let classification = ErrorClassifier::new().classify(&StreamError::with_status("busy", 503));
//! let delay = policy.retry.delay_for(&classification, 0);
//! ```

pub mod backoff;
pub mod checkpoint;
pub mod classify;
pub mod counters;
pub mod policy;
pub mod state;
pub mod types;

// Re-export main types at crate root
pub use backoff::BackoffStrategy;
pub use checkpoint::{
    longest_overlap, Checkpoint, CheckpointStore, ContinuationBuilder, OverlapDeduplicator,
    VerbatimContinuation,
};
pub use classify::{
    Classification, ClassificationRule, ErrorCategory, ErrorClassifier, FailureKind, RetryReason,
};
pub use counters::{ErrorHistory, ErrorRecord, RecoveryStrategy, RetryCounters};
pub use policy::{
    CheckPolicy, CheckpointPolicy, ContinuationPolicy, PolicyError, RetryPolicy, SessionPolicy,
    TimeoutPolicy,
};
pub use state::SessionState;
pub use types::{DriftOutcome, GuardrailOutcome, Severity, StreamError, Violation};
