//! Token source abstractions for steadfast-runtime.
//!
//! A source is anything that can be opened into a stream of normalized
//! events. Provider-specific chunk shapes are the adapter's business; the
//! orchestrator only ever sees [`SourceEvent`]s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use steadfast_core::StreamError;

mod scripted;

pub use scripted::{ScriptStep, ScriptedSource};

/// Boxed stream of normalized source events.
pub type SourceStream = BoxStream<'static, SourceEvent>;

/// What a source is asked to produce on one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceRequest {
    /// 1-based attempt number across the session
    pub attempt: u32,

    /// Index of this source in the session's source list
    pub source_index: usize,

    /// Whether this attempt re-runs the same source after a failure
    pub is_retry: bool,

    /// Whether this attempt is the first on a fallback source
    pub is_fallback: bool,

    /// Continuation input built from the last checkpoint, if resuming
    pub continuation: Option<String>,
}

/// One normalized event from a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Token {
        value: String,
        at: DateTime<Utc>,
    },
    /// Non-token payload (tool calls, metadata, ...)
    Message {
        value: serde_json::Value,
        role: Option<String>,
        at: DateTime<Utc>,
    },
    Error {
        error: StreamError,
        at: DateTime<Utc>,
    },
    Done {
        at: DateTime<Utc>,
    },
}

impl SourceEvent {
    pub fn token(value: impl Into<String>) -> Self {
        Self::Token {
            value: value.into(),
            at: Utc::now(),
        }
    }

    pub fn message(value: serde_json::Value, role: Option<String>) -> Self {
        Self::Message {
            value,
            role,
            at: Utc::now(),
        }
    }

    pub fn error(error: StreamError) -> Self {
        Self::Error {
            error,
            at: Utc::now(),
        }
    }

    pub fn done() -> Self {
        Self::Done { at: Utc::now() }
    }

    /// When the source produced this event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Token { at, .. }
            | Self::Message { at, .. }
            | Self::Error { at, .. }
            | Self::Done { at } => *at,
        }
    }
}

/// Factory that opens a fresh stream for each attempt.
///
/// # Contract
/// - `open` is called once per attempt; the returned stream is consumed
///   by exactly one attempt and dropped when that attempt ends
/// - Failures may be reported either by `open` returning `Err` or by the
///   stream yielding [`SourceEvent::Error`]; both are handled identically
/// - A stream that ends without `Done` is treated as a natural end
#[async_trait]
pub trait SourceFactory: Send + Sync {
    /// Name used in events and logs.
    fn name(&self) -> &str;

    /// Open a stream for one attempt.
    async fn open(&self, request: SourceRequest) -> Result<SourceStream, StreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_constructors() {
        assert!(matches!(SourceEvent::token("hi"), SourceEvent::Token { value, .. } if value == "hi"));
        assert!(matches!(SourceEvent::done(), SourceEvent::Done { .. }));

        let before = Utc::now();
        let event = SourceEvent::error(StreamError::source("boom"));
        assert!(event.timestamp() >= before);
    }
}
