//! Per-path work lanes over a bounded worker pool.
//!
//! Events for one path run strictly one at a time, in generation order; at
//! most one further event waits behind the running one, and a newer arrival
//! replaces it. Different paths run concurrently up to the worker limit.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::watcher::StableEvent;

use super::ingest::{IngestOutcome, Ingestor};

#[derive(Debug, Default)]
struct Lane {
    /// Next event to run once the current one finishes
    pending: Option<StableEvent>,
}

/// Counters over every run the scheduler finished.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    completed: AtomicU64,
    unchanged: AtomicU64,
    superseded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub completed: u64,
    pub unchanged: u64,
    pub superseded: u64,
    pub failed: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct Scheduler {
    ingestor: Arc<Ingestor>,
    lanes: Arc<DashMap<PathBuf, Lane>>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(ingestor: Arc<Ingestor>, workers: usize) -> Self {
        Self {
            ingestor,
            lanes: Arc::new(DashMap::new()),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    /// Queue a stable event on its path's lane.
    pub fn submit(&self, event: StableEvent) {
        self.ingestor
            .generations()
            .submit(&event.path, event.generation);

        match self.lanes.entry(event.path.clone()) {
            Entry::Occupied(mut lane) => {
                if let Some(skipped) = lane.get_mut().pending.replace(event) {
                    crate::debug_event!(
                        "scheduler",
                        "skipped",
                        "{}#{}",
                        skipped.path.display(),
                        skipped.generation
                    );
                    self.stats.superseded.fetch_add(1, Ordering::Relaxed);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Lane::default());
                self.spawn_lane(event);
            }
        }
    }

    fn spawn_lane(&self, first: StableEvent) {
        let ingestor = self.ingestor.clone();
        let lanes = self.lanes.clone();
        let workers = self.workers.clone();
        let stats = self.stats.clone();

        self.tracker.spawn(async move {
            let path = first.path.clone();
            let mut next = Some(first);

            while let Some(event) = next.take() {
                let Ok(_permit) = workers.clone().acquire_owned().await else {
                    break;
                };
                run_one(&ingestor, &stats, &event).await;
                ingestor.generations().complete(&event.path, event.generation);

                if lanes.remove_if(&path, |_, lane| lane.pending.is_none()).is_none() {
                    next = lanes.get_mut(&path).and_then(|mut lane| lane.pending.take());
                }
            }
        });
    }

    /// Paths with a run in progress or waiting.
    pub fn active_paths(&self) -> usize {
        self.lanes.len()
    }

    pub fn stats(&self) -> SchedulerSnapshot {
        self.stats.snapshot()
    }

    /// Wait until every submitted event has been processed.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Wait for in-flight work, at most `grace`. Returns whether all finished.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "[scheduler] {} paths still in flight after {grace:?}",
                    self.lanes.len()
                );
                false
            }
        }
    }
}

async fn run_one(ingestor: &Ingestor, stats: &SchedulerStats, event: &StableEvent) {
    if ingestor.generations().is_superseded(&event.path, event.generation) {
        stats.superseded.fetch_add(1, Ordering::Relaxed);
        return;
    }

    match ingestor.ingest(event).await {
        Ok(IngestOutcome::Unchanged) => {
            stats.unchanged.fetch_add(1, Ordering::Relaxed);
        }
        Ok(IngestOutcome::Superseded) => {
            stats.superseded.fetch_add(1, Ordering::Relaxed);
        }
        Ok(_) => {
            stats.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "[scheduler] {} {} failed: {e}",
                event.kind,
                event.path.display()
            );
        }
    }
}
