//! Caller-supplied veto over retries.

use async_trait::async_trait;
use steadfast_core::{Classification, RetryCounters, StreamError};
use thiserror::Error;

/// Error raised by a veto. Treated as "do not retry".
#[derive(Error, Debug)]
#[error("retry veto failed: {0}")]
pub struct VetoError(pub String);

/// What the veto is asked about.
#[derive(Debug, Clone)]
pub struct VetoContext {
    pub error: StreamError,
    pub classification: Classification,
    /// Counters before this retry is charged
    pub counters: RetryCounters,
    pub attempt: u32,
    pub source_index: usize,
}

/// Final say over a retry the policy would allow.
///
/// Only consulted when the default decision is to retry. Returning
/// `Ok(false)` or any `Err` turns the retry into a fallback or halt. A veto
/// cannot force a retry past a fatal classification or a retry limit.
#[async_trait]
pub trait RetryVeto: Send + Sync {
    async fn should_retry(&self, context: &VetoContext) -> Result<bool, VetoError>;
}

#[async_trait]
impl<F> RetryVeto for F
where
    F: Fn(&VetoContext) -> Result<bool, VetoError> + Send + Sync,
{
    async fn should_retry(&self, context: &VetoContext) -> Result<bool, VetoError> {
        self(context)
    }
}
