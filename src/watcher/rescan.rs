//! Drift repair between the filesystem and the store.
//!
//! Events missed while the process was down (or dropped by the OS watcher) are
//! recovered by comparing what is on disk with the paths the store knows.

use std::collections::HashSet;
use std::path::PathBuf;

use walkdir::WalkDir;

use crate::types::source_key;

use super::event::{ChangeKind, WatchEvent};
use super::filter::PathFilter;

/// Every matching file currently present under the existing roots.
pub fn scan_files(filter: &PathFilter) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for root in filter.roots() {
        if !root.is_dir() {
            continue;
        }
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !e.file_type().is_dir() || filter.should_descend(e.path()));

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    if filter.matches(entry.path()) {
                        files.push(entry.into_path());
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("[rescan] skipping entry: {e}"),
            }
        }
    }

    files.sort();
    files
}

/// Synthesize the events that bring the store in line with the disk.
///
/// - on disk, unknown to the store: `created`
/// - on disk, known: `modified` (the fingerprint check makes this cheap)
/// - known, gone from disk: `deleted`
///
/// Known paths under a root that is itself missing are left alone, so an
/// unmounted volume does not wipe its knowledge.
pub fn reconcile(filter: &PathFilter, known: &HashSet<String>) -> Vec<WatchEvent> {
    let on_disk = scan_files(filter);
    let mut seen = HashSet::with_capacity(on_disk.len());
    let mut events = Vec::with_capacity(on_disk.len());

    for path in on_disk {
        let key = source_key(&path);
        let kind = if known.contains(&key) {
            ChangeKind::Modified
        } else {
            ChangeKind::Created
        };
        seen.insert(key);
        events.push(WatchEvent::new(path, kind));
    }

    let mut vanished: Vec<&String> = known.iter().filter(|k| !seen.contains(*k)).collect();
    vanished.sort();
    for key in vanished {
        let path = PathBuf::from(key);
        let root_present = filter.root_for(&path).is_some_and(|root| root.is_dir());
        if root_present && !path.exists() {
            events.push(WatchEvent::new(path, ChangeKind::Deleted));
        }
    }

    events
}
