//! Per-session mutable state.
//!
//! Exactly one attempt writes to this at a time. Switching attempts either
//! resets the content or seeds it from the checkpoint, never both.

use serde::Serialize;
use std::time::Instant;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::counters::{ErrorHistory, RetryCounters};
use crate::types::Violation;

/// Accumulated state of a session, returned on success and on failure.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    /// Content accumulated by the current attempt (seeded on resume)
    pub content: String,
    pub token_count: u64,
    /// Single retained checkpoint
    pub checkpoints: CheckpointStore,
    /// Violations reported during the current attempt
    pub violations: Vec<Violation>,
    pub drift_detected: bool,
    /// Monotone for the whole session
    pub counters: RetryCounters,
    pub error_history: ErrorHistory,
    pub completed: bool,
    pub aborted: bool,
    /// Cursor into the source list; never decreases
    pub source_index: usize,
    /// 1-based attempt number across the whole session
    pub attempt: u32,
    /// Whether the current attempt was seeded from a checkpoint
    pub resumed: bool,
    #[serde(skip)]
    pub first_token_at: Option<Instant>,
    #[serde(skip)]
    pub last_token_at: Option<Instant>,
}

impl SessionState {
    pub fn new(max_error_history: usize) -> Self {
        Self {
            content: String::new(),
            token_count: 0,
            checkpoints: CheckpointStore::new(),
            violations: Vec::new(),
            drift_detected: false,
            counters: RetryCounters::new(),
            error_history: ErrorHistory::new(max_error_history),
            completed: false,
            aborted: false,
            source_index: 0,
            attempt: 0,
            resumed: false,
            first_token_at: None,
            last_token_at: None,
        }
    }

    /// Start the next attempt.
    ///
    /// With a `seed` the content starts from that checkpoint; otherwise it
    /// starts empty. Counters, history and the checkpoint itself carry over.
    pub fn begin_attempt(&mut self, seed: Option<&Checkpoint>) -> u32 {
        self.attempt += 1;
        match seed {
            Some(checkpoint) => {
                self.content.clone_from(&checkpoint.content);
                self.token_count = checkpoint.token_count;
                self.resumed = true;
            }
            None => {
                self.content.clear();
                self.token_count = 0;
                self.resumed = false;
            }
        }
        self.violations.clear();
        self.drift_detected = false;
        self.completed = false;
        self.first_token_at = None;
        self.last_token_at = None;
        self.attempt
    }

    /// Move to the next source. The cursor only advances.
    pub fn advance_source(&mut self) -> (usize, usize) {
        let from = self.source_index;
        self.source_index += 1;
        (from, self.source_index)
    }

    /// Append a delivered token.
    pub fn push_token(&mut self, token: &str, now: Instant) {
        self.content.push_str(token);
        self.token_count += 1;
        self.first_token_at.get_or_insert(now);
        self.last_token_at = Some(now);
    }

    /// Whether the attempt produced nothing but whitespace.
    pub fn is_zero_output(&self) -> bool {
        self.content.trim().is_empty()
    }

    /// The current checkpoint, if one has been captured.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.current()
    }

    /// Snapshot the current content as the last known-good checkpoint.
    pub fn capture_checkpoint(&mut self) -> &Checkpoint {
        self.checkpoints
            .capture(self.attempt, &self.content, self.token_count)
    }

    /// The checkpoint usable to resume the upcoming attempt.
    pub fn resumable_checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoints.resumable_for(self.attempt + 1).cloned()
    }

    /// Time from the first to the last token of the current attempt.
    pub fn streaming_millis(&self) -> Option<u128> {
        match (self.first_token_at, self.last_token_at) {
            (Some(first), Some(last)) => Some(last.duration_since(first).as_millis()),
            _ => None,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(ErrorHistory::default().capacity())
    }
}
