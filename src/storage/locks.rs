//! Per-source write exclusion.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// One mutex per `(project_id, source_path)`, created on demand.
///
/// Entries are dropped when no caller holds or waits on them, so memory is
/// bounded by concurrent writers rather than by the number of sources.
#[derive(Default)]
pub struct SourceLocks {
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl SourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for one source.
    pub fn with_source<T>(&self, project_id: &str, source_path: &str, f: impl FnOnce() -> T) -> T {
        let key = (project_id.to_string(), source_path.to_string());
        let lock = self.locks.entry(key.clone()).or_default().clone();

        let result = {
            let _guard = lock.lock();
            f()
        };

        // Map + our clone: nobody else is waiting
        self.locks.remove_if(&key, |_, entry| Arc::strong_count(entry) == 2);
        result
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_same_source_is_exclusive() {
        let locks = Arc::new(SourceLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    locks.with_source("p", "/kb/a.md", || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_entries_are_released() {
        let locks = SourceLocks::new();
        let value = locks.with_source("p", "/kb/a.md", || 7);
        assert_eq!(value, 7);
        assert_eq!(locks.len(), 0);
    }
}
