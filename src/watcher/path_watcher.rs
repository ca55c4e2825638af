//! Filesystem observation for the configured roots.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use super::error::WatchError;
use super::event::{ChangeKind, WatchEvent};
use super::filter::PathFilter;

/// Watches every configured root with a single recursive notify watcher.
///
/// The event stream is produced once: [`PathWatcher::subscribe`] can only be
/// called one time. Roots missing at subscribe time are retried through
/// [`PathWatcher::attach_pending_roots`].
pub struct PathWatcher {
    filter: Arc<PathFilter>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    attached: Mutex<HashSet<PathBuf>>,
    subscribed: AtomicBool,
}

impl PathWatcher {
    pub fn new(filter: Arc<PathFilter>) -> Self {
        Self {
            filter,
            watcher: Mutex::new(None),
            attached: Mutex::new(HashSet::new()),
            subscribed: AtomicBool::new(false),
        }
    }

    pub fn filter(&self) -> &Arc<PathFilter> {
        &self.filter
    }

    /// Start observing and return the merged event stream of all roots.
    ///
    /// A root that cannot be read because of permissions aborts the call; a
    /// root that does not exist yet is logged and skipped.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<WatchEvent>, WatchError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(WatchError::AlreadySubscribed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let filter = self.filter.clone();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in translate_event(&filter, event) {
                    // Receiver gone means the pipeline is shutting down
                    let _ = tx.send(change);
                }
            }
            Err(e) => {
                tracing::warn!("[watcher] file watch error: {e}");
            }
        })?;

        *self.watcher.lock() = Some(watcher);

        for root in self.filter.roots() {
            match self.attach_root(root) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    self.stop();
                    return Err(e);
                }
                Err(e) => tracing::warn!("[watcher] {e}; will retry on rescan"),
            }
        }

        crate::log_event!(
            "watcher",
            "started",
            "{}/{} roots attached",
            self.attached.lock().len(),
            self.filter.roots().len()
        );

        Ok(rx)
    }

    /// Attach roots that were missing earlier and exist now.
    ///
    /// Roots that vanished since they were attached are detached first, so one
    /// that is deleted and recreated gets a fresh watch. Returns the roots
    /// attached by this call.
    pub fn attach_pending_roots(&self) -> Vec<PathBuf> {
        self.detach_vanished_roots();

        let mut newly_attached = Vec::new();
        for root in self.pending_roots() {
            if !root.is_dir() {
                continue;
            }
            match self.attach_root(&root) {
                Ok(()) => newly_attached.push(root),
                Err(e) => tracing::warn!("[watcher] {e}"),
            }
        }
        newly_attached
    }

    /// Forget attached roots that are no longer directories.
    ///
    /// Returns the roots detached by this call.
    pub fn detach_vanished_roots(&self) -> Vec<PathBuf> {
        let vanished: Vec<PathBuf> = {
            let mut attached = self.attached.lock();
            let vanished: Vec<PathBuf> = attached.iter().filter(|r| !r.is_dir()).cloned().collect();
            for root in &vanished {
                attached.remove(root);
            }
            vanished
        };

        if let Some(watcher) = self.watcher.lock().as_mut() {
            for root in &vanished {
                // The backend may already have dropped the watch with the directory
                if let Err(e) = watcher.unwatch(root) {
                    crate::debug_event!("watcher", "unwatch", "{}: {e}", root.display());
                }
            }
        }
        for root in &vanished {
            crate::log_event!("watcher", "root vanished", "{}", root.display());
        }
        vanished
    }

    /// Roots not currently being watched.
    pub fn pending_roots(&self) -> Vec<PathBuf> {
        let attached = self.attached.lock();
        self.filter
            .roots()
            .iter()
            .filter(|root| !attached.contains(*root))
            .cloned()
            .collect()
    }

    /// Stop accepting filesystem events.
    ///
    /// Dropping the notify watcher closes the event stream once buffered events
    /// have been received.
    pub fn stop(&self) {
        if self.watcher.lock().take().is_some() {
            self.attached.lock().clear();
            crate::log_event!("watcher", "stopped");
        }
    }

    fn attach_root(&self, root: &Path) -> Result<(), WatchError> {
        if let Err(e) = std::fs::read_dir(root) {
            return Err(match e.kind() {
                io::ErrorKind::NotFound => WatchError::RootMissing {
                    path: root.to_path_buf(),
                },
                io::ErrorKind::PermissionDenied => WatchError::PermissionDenied {
                    path: root.to_path_buf(),
                },
                _ => WatchError::PathWatchFailed {
                    path: root.to_path_buf(),
                    reason: e.to_string(),
                },
            });
        }

        let mut guard = self.watcher.lock();
        let Some(watcher) = guard.as_mut() else {
            return Err(WatchError::PathWatchFailed {
                path: root.to_path_buf(),
                reason: "watcher is stopped".to_string(),
            });
        };

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| match &e.kind {
                notify::ErrorKind::Io(io) if io.kind() == io::ErrorKind::PermissionDenied => {
                    WatchError::PermissionDenied {
                        path: root.to_path_buf(),
                    }
                }
                _ => WatchError::PathWatchFailed {
                    path: root.to_path_buf(),
                    reason: e.to_string(),
                },
            })?;

        self.attached.lock().insert(root.to_path_buf());
        crate::debug_event!("watcher", "watching", "{}", root.display());
        Ok(())
    }
}

/// Map a notify event onto zero or more filtered change events.
pub(crate) fn translate_event(filter: &PathFilter, event: Event) -> Vec<WatchEvent> {
    let mut out = Vec::new();

    match event.kind {
        EventKind::Create(_) => {
            for path in event.paths {
                appeared(filter, path, &mut out);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in event.paths {
                push_if_matched(filter, path, ChangeKind::Deleted, &mut out);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in event.paths {
                appeared(filter, path, &mut out);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            if let Some(from) = paths.next() {
                push_if_matched(filter, from, ChangeKind::Deleted, &mut out);
            }
            if let Some(to) = paths.next() {
                appeared(filter, to, &mut out);
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Ambiguous rename: decide by what is on disk now
            for path in event.paths {
                if path.exists() {
                    appeared(filter, path, &mut out);
                } else {
                    push_if_matched(filter, path, ChangeKind::Deleted, &mut out);
                }
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => {}
        EventKind::Modify(_) => {
            for path in event.paths {
                push_if_matched(filter, path, ChangeKind::Modified, &mut out);
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths {
                push_if_matched(filter, path, ChangeKind::Deleted, &mut out);
            }
        }
        _ => {}
    }

    out
}

/// A path showed up. Directories are expanded into their matching files.
fn appeared(filter: &PathFilter, path: PathBuf, out: &mut Vec<WatchEvent>) {
    if path.is_dir() {
        if !filter.should_descend(&path) {
            return;
        }
        let walker = WalkDir::new(&path)
            .into_iter()
            .filter_entry(|e| !e.file_type().is_dir() || filter.should_descend(e.path()));
        for entry in walker.filter_map(Result::ok) {
            if entry.file_type().is_file() {
                push_if_matched(filter, entry.into_path(), ChangeKind::Created, out);
            }
        }
    } else {
        push_if_matched(filter, path, ChangeKind::Created, out);
    }
}

fn push_if_matched(filter: &PathFilter, path: PathBuf, kind: ChangeKind, out: &mut Vec<WatchEvent>) {
    if filter.matches(&path) {
        out.push(WatchEvent::new(path, kind));
    } else {
        crate::debug_event!("watcher", "unmatched", "{kind} {}", path.display());
    }
}
