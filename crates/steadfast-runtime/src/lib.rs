//! # steadfast-runtime
//!
//! Resilient orchestration for token-streaming sources.
//!
//! A session runs one attempt at a time against an ordered list of
//! sources. Failures (transport errors, stalled streams, guardrail
//! violations, drift, empty output) are classified and turned into a
//! retry, a fallback to the next source, or a halt. Every step is
//! published on an event bus that never blocks token delivery.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use steadfast_runtime::{ScriptedSource, SessionOrchestrator};
//!
//! let orchestrator = SessionOrchestrator::builder()
//!     .source(Arc::new(primary))
//!     .source(Arc::new(backup))
//!     .policy(SessionPolicy::from_file("policy.yaml")?)
//!     .handler(Arc::new(|event: &Event| println!("{}", event.event_type())))
//!     .build()?;
//!
//! let state = orchestrator.run(|delivery| print!("{delivery:?}")).await?;
//! ```

use steadfast_core::{PolicyError, SessionState, StreamError};
use thiserror::Error;

mod attempt;
pub mod checks;
pub mod events;
pub mod orchestrator;
pub mod resilience;
pub mod sources;
pub mod stream;

pub use checks::{
    CheckInput, CheckReport, CheckScheduler, DriftDetector, Guardrail, GuardrailSet,
    PatternGuardrail, PatternRule,
};
pub use events::{
    BatchConfig, BusConfig, Event, EventBus, EventHandler, EventKind, GiveUpReason,
    HandlerError, TimeoutKind,
};
pub use orchestrator::{AbortHandle, SessionOrchestrator, SessionOrchestratorBuilder};
pub use resilience::{Decision, RetryDecisionEngine, RetryVeto, SourceChain, VetoContext, VetoError};
pub use sources::{ScriptStep, ScriptedSource, SourceEvent, SourceFactory, SourceRequest, SourceStream};
pub use stream::{Delivery, SessionStream};

/// Terminal outcome of a session that did not complete.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No retry or fallback remained; carries the original failure unmodified
    #[error("session halted: {error}")]
    Halted {
        error: StreamError,
        state: Box<SessionState>,
    },

    #[error("session aborted after {} tokens", .state.token_count)]
    Aborted { state: Box<SessionState> },

    #[error("no sources configured")]
    NoSources,

    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("session task failed: {0}")]
    Internal(String),
}

impl SessionError {
    /// State at the moment the session ended, when it got that far.
    pub fn state(&self) -> Option<&SessionState> {
        match self {
            SessionError::Halted { state, .. } | SessionError::Aborted { state } => Some(state),
            _ => None,
        }
    }

    /// The failure that halted the session.
    pub fn stream_error(&self) -> Option<&StreamError> {
        match self {
            SessionError::Halted { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, SessionError::Aborted { .. })
    }
}
