//! Caller-facing delivery types and the spawned session stream.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use steadfast_core::SessionState;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::SessionError;

/// What the caller receives while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Text appended to the session content
    Token(String),
    /// Non-token payload passed through from the source
    Message {
        value: serde_json::Value,
        role: Option<String>,
    },
}

impl Delivery {
    /// The token text, if this is a token.
    pub fn as_token(&self) -> Option<&str> {
        match self {
            Delivery::Token(text) => Some(text),
            Delivery::Message { .. } => None,
        }
    }
}

/// A session running on its own task.
///
/// Yields deliveries in order; [`finish`](Self::finish) returns the final
/// state (or the terminal error) once the session is over.
pub struct SessionStream {
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    task: JoinHandle<Result<SessionState, SessionError>>,
}

impl SessionStream {
    pub(crate) fn new(
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        task: JoinHandle<Result<SessionState, SessionError>>,
    ) -> Self {
        Self { deliveries, task }
    }

    /// Wait for the session to end.
    ///
    /// Deliveries not yet read are dropped.
    pub async fn finish(self) -> Result<SessionState, SessionError> {
        drop(self.deliveries);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SessionError::Internal(e.to_string())),
        }
    }
}

impl Stream for SessionStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delivery>> {
        self.deliveries.poll_recv(cx)
    }
}
