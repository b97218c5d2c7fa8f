//! Retry counters and the bounded error history.
//!
//! Counters only ever grow for the life of a session. The history keeps
//! the most recent `max` decisions and evicts the oldest beyond that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::classify::{Classification, ErrorCategory, FailureKind};

/// What the session does about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Run the same source again
    Retry,
    /// Advance to the next source
    Fallback,
    /// Re-raise the failure to the caller
    Halt,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Halt => "halt",
        };
        f.write_str(s)
    }
}

/// Per-category retry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounters {
    /// Bounded by the policy's `attempts`
    pub model: u32,
    pub network: u32,
    pub transient: u32,
}

impl RetryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries across every category.
    pub fn total(&self) -> u32 {
        self.model + self.network + self.transient
    }

    /// Retries already charged to a category. Fatal is never charged.
    pub fn for_category(&self, category: ErrorCategory) -> u32 {
        match category {
            ErrorCategory::Model => self.model,
            ErrorCategory::Network => self.network,
            ErrorCategory::Transient => self.transient,
            ErrorCategory::Fatal => 0,
        }
    }

    /// Charge one retry to a category.
    ///
    /// Returns false (and changes nothing) for the fatal category.
    pub fn record(&mut self, category: ErrorCategory) -> bool {
        let slot = match category {
            ErrorCategory::Model => &mut self.model,
            ErrorCategory::Network => &mut self.network,
            ErrorCategory::Transient => &mut self.transient,
            ErrorCategory::Fatal => return false,
        };
        *slot = slot.saturating_add(1);
        true
    }
}

/// One classified failure and what was decided about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: FailureKind,
    pub category: ErrorCategory,
    pub message: String,
    pub attempt: u32,
    pub source_index: usize,
    pub strategy: RecoveryStrategy,
    pub at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(
        classification: &Classification,
        message: impl Into<String>,
        attempt: u32,
        source_index: usize,
        strategy: RecoveryStrategy,
    ) -> Self {
        Self {
            kind: classification.kind,
            category: classification.category,
            message: message.into(),
            attempt,
            source_index,
            strategy,
            at: Utc::now(),
        }
    }
}

/// Length-bounded ring of recent decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHistory {
    entries: VecDeque<ErrorRecord>,
    max: usize,
    evicted: u64,
}

impl ErrorHistory {
    pub fn new(max: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max.min(64)),
            max,
            evicted: 0,
        }
    }

    /// Append a record, evicting the oldest past the bound.
    pub fn push(&mut self, record: ErrorRecord) {
        if self.max == 0 {
            self.evicted += 1;
            return;
        }
        while self.entries.len() >= self.max {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Maximum number of retained records.
    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records dropped because the ring was full.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&ErrorRecord> {
        self.entries.back()
    }

    /// The bounded network-error log.
    pub fn network_errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.entries
            .iter()
            .filter(|r| r.category == ErrorCategory::Network)
    }
}

impl Default for ErrorHistory {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: FailureKind, attempt: u32) -> ErrorRecord {
        ErrorRecord::new(
            &Classification::from(kind),
            "boom",
            attempt,
            0,
            RecoveryStrategy::Retry,
        )
    }

    #[test]
    fn test_counters_by_category() {
        let mut counters = RetryCounters::new();
        assert!(counters.record(ErrorCategory::Model));
        assert!(counters.record(ErrorCategory::Network));
        assert!(counters.record(ErrorCategory::Network));
        assert!(!counters.record(ErrorCategory::Fatal));

        assert_eq!(counters.model, 1);
        assert_eq!(counters.network, 2);
        assert_eq!(counters.transient, 0);
        assert_eq!(counters.total(), 3);
        assert_eq!(counters.for_category(ErrorCategory::Fatal), 0);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = ErrorHistory::new(2);
        history.push(record(FailureKind::Drift, 1));
        history.push(record(FailureKind::ConnectionReset, 2));
        history.push(record(FailureKind::ZeroOutput, 3));

        assert_eq!(history.len(), 2);
        assert_eq!(history.evicted(), 1);
        let attempts: Vec<u32> = history.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![2, 3]);
        assert_eq!(history.network_errors().count(), 1);
    }

    #[test]
    fn test_zero_sized_history_keeps_nothing() {
        let mut history = ErrorHistory::new(0);
        history.push(record(FailureKind::Drift, 1));
        assert!(history.is_empty());
        assert_eq!(history.evicted(), 1);
    }
}
