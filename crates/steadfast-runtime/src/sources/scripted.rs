//! Deterministic source that replays scripted steps.
//!
//! Each call to `open` consumes the next per-attempt script; once the
//! scripts run out the last one is replayed. Used by the CLI and by tests.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use steadfast_core::policy::duration_ms;
use steadfast_core::StreamError;

use super::{SourceEvent, SourceFactory, SourceRequest, SourceStream};

/// One step of a scripted attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptStep {
    Token {
        value: String,
    },
    Message {
        value: serde_json::Value,
        #[serde(default)]
        role: Option<String>,
    },
    /// Stall before the next step
    Delay {
        #[serde(with = "duration_ms")]
        duration: Duration,
    },
    /// Yield a source error and end the stream
    Fail {
        message: String,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        code: Option<String>,
    },
    Done,
}

impl ScriptStep {
    pub fn token(value: impl Into<String>) -> Self {
        Self::Token {
            value: value.into(),
        }
    }

    pub fn delay(duration: Duration) -> Self {
        Self::Delay { duration }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
            status: None,
            code: None,
        }
    }

    pub fn fail_status(message: impl Into<String>, status: u16) -> Self {
        Self::Fail {
            message: message.into(),
            status: Some(status),
            code: None,
        }
    }

    fn into_event(self) -> Option<SourceEvent> {
        match self {
            ScriptStep::Token { value } => Some(SourceEvent::token(value)),
            ScriptStep::Message { value, role } => Some(SourceEvent::message(value, role)),
            ScriptStep::Fail {
                message,
                status,
                code,
            } => Some(SourceEvent::error(StreamError::Source {
                message,
                status,
                code,
            })),
            ScriptStep::Done => Some(SourceEvent::done()),
            ScriptStep::Delay { .. } => None,
        }
    }
}

/// Source replaying one script per attempt.
#[derive(Debug)]
pub struct ScriptedSource {
    name: String,
    attempts: Vec<Vec<ScriptStep>>,
    opened: Mutex<Vec<SourceRequest>>,
}

impl ScriptedSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attempts: Vec::new(),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Append the script for the next attempt.
    pub fn attempt(mut self, steps: Vec<ScriptStep>) -> Self {
        self.attempts.push(steps);
        self
    }

    /// A source that always emits these tokens and completes.
    pub fn tokens(name: impl Into<String>, tokens: &[&str]) -> Self {
        Self::new(name).attempt(tokens.iter().map(|t| ScriptStep::token(*t)).collect())
    }

    /// A source that always fails immediately.
    pub fn failing(name: impl Into<String>, step: ScriptStep) -> Self {
        Self::new(name).attempt(vec![step])
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<SourceRequest> {
        self.opened.lock().clone()
    }

    fn script_for(&self, call: usize) -> Vec<ScriptStep> {
        self.attempts
            .get(call)
            .or_else(|| self.attempts.last())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceFactory for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, request: SourceRequest) -> Result<SourceStream, StreamError> {
        let call = {
            let mut opened = self.opened.lock();
            opened.push(request);
            opened.len() - 1
        };
        let steps: VecDeque<ScriptStep> = self.script_for(call).into();

        let events = stream::unfold(steps, |mut steps| async move {
            loop {
                let step = steps.pop_front()?;
                if let ScriptStep::Delay { duration } = step {
                    tokio::time::sleep(duration).await;
                    continue;
                }
                if matches!(step, ScriptStep::Fail { .. } | ScriptStep::Done) {
                    steps.clear();
                }
                return step.into_event().map(|event| (event, steps));
            }
        });

        Ok(events.boxed())
    }
}
