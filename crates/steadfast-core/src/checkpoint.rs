//! Checkpoints and continuation.
//!
//! A checkpoint is the last known-good content snapshot of a session. At
//! most one is retained: each capture replaces the previous one. When a
//! retry or fallback resumes from a checkpoint, the new source's head may
//! repeat the checkpoint's tail; [`OverlapDeduplicator`] strips that
//! repetition so text is never duplicated at the splice point.

use serde::{Deserialize, Serialize, Serializer};

/// Immutable content snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub content: String,
    pub token_count: u64,
}

impl Checkpoint {
    pub fn new(content: impl Into<String>, token_count: u64) -> Self {
        Self {
            content: content.into(),
            token_count,
        }
    }
}

/// Holds the single retained checkpoint and the attempt that captured it.
#[derive(Debug, Clone, Default)]
pub struct CheckpointStore {
    current: Option<(u32, Checkpoint)>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any prior snapshot.
    pub fn capture(&mut self, attempt: u32, content: &str, token_count: u64) -> &Checkpoint {
        let checkpoint = Checkpoint::new(content, token_count);
        &self.current.insert((attempt, checkpoint)).1
    }

    pub fn current(&self) -> Option<&Checkpoint> {
        self.current.as_ref().map(|(_, c)| c)
    }

    /// The checkpoint usable to resume `attempt`.
    ///
    /// Only snapshots captured under the same or an earlier attempt qualify.
    pub fn resumable_for(&self, attempt: u32) -> Option<&Checkpoint> {
        self.current
            .as_ref()
            .filter(|(captured, _)| *captured <= attempt)
            .map(|(_, c)| c)
    }

    /// The attempt that captured the current snapshot.
    pub fn captured_by(&self) -> Option<u32> {
        self.current.as_ref().map(|(attempt, _)| *attempt)
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

// Serialized as the bare checkpoint (or null).
impl Serialize for CheckpointStore {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.current().serialize(serializer)
    }
}

/// Builds the input handed to a resumed source.
pub trait ContinuationBuilder: Send + Sync {
    fn build(&self, checkpoint: &Checkpoint) -> String;
}

/// Hands the checkpoint content to the source verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerbatimContinuation;

impl ContinuationBuilder for VerbatimContinuation {
    fn build(&self, checkpoint: &Checkpoint) -> String {
        checkpoint.content.clone()
    }
}

impl<F> ContinuationBuilder for F
where
    F: Fn(&Checkpoint) -> String + Send + Sync,
{
    fn build(&self, checkpoint: &Checkpoint) -> String {
        self(checkpoint)
    }
}

/// Length in bytes of the longest suffix of `existing` that is also a
/// prefix of `incoming`, ignoring overlaps shorter than `min_chars`.
///
/// Always returns a char boundary of `incoming`.
pub fn longest_overlap(existing: &str, incoming: &str, min_chars: usize) -> usize {
    let mut best = 0;
    let mut chars = 0;
    for (idx, ch) in incoming.char_indices() {
        let end = idx + ch.len_utf8();
        chars += 1;
        if end > existing.len() {
            break;
        }
        if chars >= min_chars.max(1) && existing.ends_with(&incoming[..end]) {
            best = end;
        }
    }
    best
}

/// Streaming deduplicator for the head of a resumed attempt.
///
/// Tokens are buffered while the buffered text could still be the start of
/// a repetition of the checkpoint's tail. Once it can no longer be (or the
/// stream ends), the overlap is cut and the remainder released.
#[derive(Debug, Clone)]
pub struct OverlapDeduplicator {
    checkpoint: String,
    buffer: String,
    min_overlap: usize,
    removed: Option<usize>,
    removed_chars: usize,
}

impl OverlapDeduplicator {
    pub fn new(checkpoint: impl Into<String>, min_overlap: usize) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            buffer: String::new(),
            min_overlap,
            removed: None,
            removed_chars: 0,
        }
    }

    /// Whether the splice point has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.removed.is_some()
    }

    /// Bytes cut from the head once resolved.
    pub fn removed(&self) -> Option<usize> {
        self.removed
    }

    /// Chars cut from the head (0 until resolved).
    pub fn removed_chars(&self) -> usize {
        self.removed_chars
    }

    /// Feed the next token. Returns text ready for delivery, if any.
    pub fn push(&mut self, token: &str) -> Option<String> {
        if self.removed.is_some() {
            return Some(token.to_string());
        }
        self.buffer.push_str(token);
        if self.could_still_overlap() {
            return None;
        }
        self.resolve()
    }

    /// Resolve with whatever has been buffered. Call when the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.removed.is_some() {
            return None;
        }
        self.resolve()
    }

    fn resolve(&mut self) -> Option<String> {
        let cut = longest_overlap(&self.checkpoint, &self.buffer, self.min_overlap);
        self.removed = Some(cut);
        self.removed_chars = self.buffer[..cut].chars().count();
        let rest = self.buffer.split_off(cut);
        self.buffer.clear();
        (!rest.is_empty()).then_some(rest)
    }

    /// True while some suffix of the checkpoint starts with the buffer.
    fn could_still_overlap(&self) -> bool {
        if self.buffer.len() >= self.checkpoint.len() {
            return false;
        }
        self.checkpoint
            .char_indices()
            .any(|(idx, _)| self.checkpoint[idx..].starts_with(&self.buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_capture_replaces() {
        let mut store = CheckpointStore::new();
        store.capture(1, "hello", 1);
        store.capture(1, "hello world", 2);
        assert_eq!(store.current(), Some(&Checkpoint::new("hello world", 2)));
        assert_eq!(store.captured_by(), Some(1));
    }

    #[test]
    fn test_resumable_only_for_same_or_later_attempt() {
        let mut store = CheckpointStore::new();
        store.capture(2, "abc", 3);
        assert!(store.resumable_for(1).is_none());
        assert!(store.resumable_for(2).is_some());
        assert!(store.resumable_for(3).is_some());
        store.clear();
        assert!(store.resumable_for(3).is_none());
    }

    #[test]
    fn test_verbatim_and_closure_builders() {
        let checkpoint = Checkpoint::new("partial", 1);
        assert_eq!(VerbatimContinuation.build(&checkpoint), "partial");

        let prompt = |c: &Checkpoint| format!("Continue from: {}", c.content);
        assert_eq!(prompt.build(&checkpoint), "Continue from: partial");
    }

    #[test]
    fn test_longest_overlap() {
        assert_eq!(longest_overlap("The quick brown", "brown fox", 2), 5);
        assert_eq!(longest_overlap("abc", "xyz", 2), 0);
        // Single-char coincidences are ignored under min_overlap=2
        assert_eq!(longest_overlap("abc", "cat", 2), 0);
        assert_eq!(longest_overlap("abc", "cat", 1), 1);
        assert_eq!(longest_overlap("héllo wörld", "wörld!", 2), "wörld".len());
    }

    #[test]
    fn test_dedup_strips_repeated_tail() {
        let mut dedup = OverlapDeduplicator::new("The quick brown", 2);
        assert_eq!(dedup.push("bro"), None);
        assert_eq!(dedup.push("wn"), None);
        assert_eq!(dedup.push(" fox"), Some(" fox".to_string()));
        assert_eq!(dedup.removed(), Some(5));
        assert_eq!(dedup.removed_chars(), 5);
        assert_eq!(dedup.push(" jumps"), Some(" jumps".to_string()));
    }

    #[test]
    fn test_dedup_passes_through_without_overlap() {
        let mut dedup = OverlapDeduplicator::new("token0 token1 ", 2);
        assert_eq!(dedup.push("continued"), Some("continued".to_string()));
        assert_eq!(dedup.removed(), Some(0));
    }

    #[test]
    fn test_dedup_finish_flushes_buffer() {
        let mut dedup = OverlapDeduplicator::new("hello world", 2);
        assert_eq!(dedup.push("ld"), None);
        assert_eq!(dedup.finish(), None);
        assert_eq!(dedup.removed(), Some(2));

        // A prefix of the tail that is not itself a suffix is kept
        let mut dedup = OverlapDeduplicator::new("hello world", 2);
        assert_eq!(dedup.push("wor"), None);
        assert_eq!(dedup.finish(), Some("wor".to_string()));

        let mut dedup = OverlapDeduplicator::new("hello world", 2);
        assert_eq!(dedup.push("d"), None);
        assert_eq!(dedup.finish(), Some("d".to_string()));
    }

    proptest! {
        #[test]
        fn prop_splice_never_duplicates(
            prefix in "[a-z ]{0,12}",
            overlap in "[a-z]{2,8}",
            suffix in "[A-Z]{1,8}",
        ) {
            let checkpoint = format!("{prefix}{overlap}");
            let mut dedup = OverlapDeduplicator::new(checkpoint.clone(), 2);
            let mut out = String::new();
            for ch in format!("{overlap}{suffix}").chars() {
                if let Some(text) = dedup.push(&ch.to_string()) {
                    out.push_str(&text);
                }
            }
            if let Some(text) = dedup.finish() {
                out.push_str(&text);
            }
            prop_assert_eq!(format!("{checkpoint}{out}"), format!("{checkpoint}{suffix}"));
        }
    }
}
