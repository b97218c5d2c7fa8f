//! Resilience patterns for steadfast-runtime.
//!
//! This module provides:
//! - The retry decision engine (classify, decide, charge counters)
//! - An optional asynchronous veto over retries
//! - The ordered source chain used for fallback

mod decision;
mod fallback;
mod veto;

pub use decision::{Decision, RetryDecisionEngine, Verdict};
pub use fallback::SourceChain;
pub use veto::{RetryVeto, VetoContext, VetoError};
