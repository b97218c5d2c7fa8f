//! Ordered list of sources: index 0 is the primary, the rest are
//! fallbacks tried in order.

use std::sync::Arc;

use crate::sources::SourceFactory;

#[derive(Clone, Default)]
pub struct SourceChain {
    sources: Vec<Arc<dyn SourceFactory>>,
}

impl SourceChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source after every existing one.
    pub fn add(mut self, source: Arc<dyn SourceFactory>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn SourceFactory>> {
        self.sources.get(index)
    }

    /// Whether a fallback exists after `index`.
    pub fn has_next(&self, index: usize) -> bool {
        index + 1 < self.sources.len()
    }

    pub fn name(&self, index: usize) -> &str {
        self.get(index).map(|s| s.name()).unwrap_or("unknown")
    }
}

impl std::fmt::Debug for SourceChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("SourceChain").field("sources", &names).finish()
    }
}
