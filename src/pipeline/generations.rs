//! Latest submitted generation per path.

use std::path::{Path, PathBuf};

use dashmap::DashMap;

/// Tracks the newest stable event submitted for each path.
///
/// A run whose generation is older than the latest one submitted for its path
/// is superseded: it finishes its work but must not write.
#[derive(Debug, Default)]
pub struct Generations {
    latest: DashMap<PathBuf, u64>,
}

impl Generations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submission. Older generations never overwrite newer ones.
    pub fn submit(&self, path: &Path, generation: u64) {
        self.latest
            .entry(path.to_path_buf())
            .and_modify(|g| *g = (*g).max(generation))
            .or_insert(generation);
    }

    pub fn latest(&self, path: &Path) -> Option<u64> {
        self.latest.get(path).map(|g| *g)
    }

    pub fn is_superseded(&self, path: &Path, generation: u64) -> bool {
        self.latest(path).is_some_and(|latest| latest > generation)
    }

    /// Forget a path once its latest generation has completed.
    pub fn complete(&self, path: &Path, generation: u64) {
        self.latest.remove_if(path, |_, latest| *latest == generation);
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
