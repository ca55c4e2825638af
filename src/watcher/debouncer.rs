//! Per-path debouncing of raw change events.
//!
//! Editors and writers touch a file several times per save (truncate, write,
//! rename, chmod). Each event resets the path's quiet interval; once a path has
//! been quiet for the configured duration it is emitted exactly once with the
//! latest kind observed. Deletions are not delayed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};

use super::event::{ChangeKind, StableEvent, WatchEvent};

#[derive(Debug, Clone, Copy)]
struct Pending {
    deadline: Instant,
    kind: ChangeKind,
    generation: u64,
}

/// Debounces change events by path.
///
/// Memory is bounded by the number of dirty paths: an entry exists only while
/// its timer is pending.
pub struct Debouncer {
    pending: HashMap<PathBuf, Pending>,
    duration: Duration,
    clock: Arc<dyn Clock>,
    /// Last generation handed out, shared by all paths.
    generation: u64,
}

impl Debouncer {
    pub fn new(duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: HashMap::new(),
            duration,
            clock,
            generation: 0,
        }
    }

    pub fn with_system_clock(duration: Duration) -> Self {
        Self::new(duration, Arc::new(SystemClock))
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Record a change event.
    ///
    /// Returns a stable event right away for deletions, which also discard any
    /// pending timer for the path. Every other kind resets the path's timer.
    pub fn record(&mut self, event: WatchEvent) -> Option<StableEvent> {
        self.generation += 1;
        let generation = self.generation;

        if event.kind == ChangeKind::Deleted {
            self.pending.remove(&event.path);
            return Some(StableEvent {
                path: event.path,
                kind: ChangeKind::Deleted,
                generation,
            });
        }

        let deadline = self.clock.now() + self.duration;
        self.pending.insert(
            event.path,
            Pending {
                deadline,
                kind: event.kind,
                generation,
            },
        );
        None
    }

    /// Take every path whose quiet interval has elapsed.
    ///
    /// Results are ordered by generation.
    pub fn take_ready(&mut self) -> Vec<StableEvent> {
        let now = self.clock.now();
        let mut ready = Vec::new();

        self.pending.retain(|path, pending| {
            if pending.deadline <= now {
                ready.push(StableEvent {
                    path: path.clone(),
                    kind: pending.kind,
                    generation: pending.generation,
                });
                false
            } else {
                true
            }
        });

        ready.sort_by_key(|e| e.generation);
        ready
    }

    /// Flush every pending timer immediately. Used on shutdown.
    pub fn drain(&mut self) -> Vec<StableEvent> {
        let mut flushed: Vec<StableEvent> = self
            .pending
            .drain()
            .map(|(path, pending)| StableEvent {
                path,
                kind: pending.kind,
                generation: pending.generation,
            })
            .collect();
        flushed.sort_by_key(|e| e.generation);
        flushed
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
