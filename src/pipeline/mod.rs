//! Top-level ingestion controller.
//!
//! ```text
//!  PathWatcher ──WatchEvent──► Debouncer ──StableEvent──► Scheduler ──► Ingestor
//!       ▲                          ▲                      (per-path     load
//!       │                          │                       lanes,       distill
//!   notify roots            rescan / reconcile             N workers)   embed
//!                                                                       store
//! ```
//!
//! The debouncer and the lane table are the only process-wide mutable state.
//! Both are owned here, built at startup and torn down at shutdown.

mod generations;
mod ingest;
mod retry;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, Settings};
use crate::distill::{DistillSettings, Distiller, NeighborIndex, RoleError, Roles};
use crate::documents::ContentLoader;
use crate::semantic::{self, EmbedError, Embedder};
use crate::storage::{KnowledgeStore, StoreError};
use crate::types::ProjectIdentity;
use crate::watcher::{Debouncer, PathFilter, PathWatcher, WatchError, WatchEvent, rescan};

pub use generations::Generations;
pub use ingest::{IngestError, IngestOutcome, Ingestor};
pub use retry::{RetryPolicy, Retryable};
pub use scheduler::{Scheduler, SchedulerSnapshot};

/// Longest pause between debouncer polls.
const MAX_TICK: Duration = Duration::from_millis(100);
const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Role(#[from] RoleError),

    #[error("Pipeline task failed: {0}")]
    Task(String),
}

/// The swappable collaborators of a pipeline.
pub struct Components {
    pub store: KnowledgeStore,
    pub embedder: Arc<dyn Embedder>,
    pub roles: Roles,
}

impl Components {
    pub fn from_settings(settings: &Settings) -> Result<Self, PipelineError> {
        let store = KnowledgeStore::open(&settings.storage.location()?)?;
        let embedder = semantic::from_config(&settings.embedding, &settings.pipeline)?;
        let roles = Roles::from_settings(settings)?;
        Ok(Self {
            store,
            embedder,
            roles,
        })
    }
}

pub struct Pipeline {
    settings: Settings,
    identity: ProjectIdentity,
    filter: Arc<PathFilter>,
    store: KnowledgeStore,
    embedder: Arc<dyn Embedder>,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(settings: Settings, identity: ProjectIdentity, components: Components) -> Self {
        let policy = RetryPolicy::from_config(&settings.pipeline);
        let Components {
            store,
            embedder,
            roles,
        } = components;

        let neighbors: Arc<dyn NeighborIndex> = Arc::new(store.clone());
        let distiller = Distiller::new(
            roles,
            embedder.clone(),
            neighbors,
            policy.clone(),
            DistillSettings::from_settings(&settings),
        );
        let ingestor = Ingestor::new(
            identity.clone(),
            ContentLoader::from_config(&settings.watcher),
            distiller,
            store.clone(),
            Arc::new(Generations::new()),
            policy,
        );
        let scheduler = Scheduler::new(Arc::new(ingestor), settings.pipeline.workers);

        Self {
            filter: Arc::new(PathFilter::from_config(&settings.watcher)),
            settings,
            identity,
            store,
            embedder,
            scheduler,
            clock: Arc::new(SystemClock),
        }
    }

    /// Build every collaborator from configuration.
    pub fn from_settings(settings: Settings) -> Result<Self, PipelineError> {
        let identity = ProjectIdentity::from_settings(&settings);
        let components = Components::from_settings(&settings)?;
        Ok(Self::new(settings, identity, components))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn identity(&self) -> &ProjectIdentity {
        &self.identity
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Events that bring the store in line with what is on disk.
    pub async fn reconcile_events(&self) -> Result<Vec<WatchEvent>, PipelineError> {
        let project = self.identity.project_id.clone();
        let known = self
            .store
            .run_blocking(move |s| s.known_paths(&project))
            .await?;

        let filter = self.filter.clone();
        tokio::task::spawn_blocking(move || rescan::reconcile(&filter, &known))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))
    }

    /// Reconcile once, process everything and return.
    pub async fn scan(&self) -> Result<SchedulerSnapshot, PipelineError> {
        let mut debouncer = Debouncer::new(self.settings.watcher.debounce(), self.clock.clone());
        let events = self.reconcile_events().await?;
        crate::log_event!("pipeline", "scan", "{} paths to check", events.len());

        self.feed(&mut debouncer, events);
        for stable in debouncer.drain() {
            self.scheduler.submit(stable);
        }

        self.scheduler.wait_idle().await;
        let stats = self.scheduler.stats();
        crate::log_event!(
            "pipeline",
            "scan complete",
            "{} stored, {} unchanged, {} failed",
            stats.completed,
            stats.unchanged,
            stats.failed
        );
        Ok(stats)
    }

    /// Watch the roots until `cancel` fires, then drain and shut down.
    ///
    /// In-flight work gets `pipeline.shutdown_grace_seconds` to finish.
    pub async fn run(&self, cancel: CancellationToken) -> Result<SchedulerSnapshot, PipelineError> {
        let watcher = PathWatcher::new(self.filter.clone());
        let mut events = watcher.subscribe()?;
        let mut debouncer = Debouncer::new(self.settings.watcher.debounce(), self.clock.clone());

        crate::log_event!(
            "pipeline",
            "started",
            "project {} ({} roots, {} workers)",
            self.identity.project_id,
            self.filter.roots().len(),
            self.settings.pipeline.workers
        );

        self.feed(&mut debouncer, self.reconcile_events().await?);
        let reembed = self.spawn_reembed(&cancel);

        let tick_every = self.settings.watcher.debounce().clamp(MIN_TICK, MAX_TICK);
        let mut tick = tokio::time::interval(tick_every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let rescan_every = Duration::from_secs(self.settings.watcher.rescan_interval_seconds);
        let mut rescan = (!rescan_every.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + rescan_every, rescan_every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        let mut stream_open = true;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                // Ahead of events: a busy stream must not hold back settled paths
                _ = tick.tick() => self.flush_ready(&mut debouncer),

                received = events.recv(), if stream_open => match received {
                    Some(event) => self.handle_event(&mut debouncer, event),
                    None => {
                        tracing::warn!("[pipeline] watcher stream closed; relying on rescans");
                        stream_open = false;
                    }
                },

                Some(_) = next_tick(&mut rescan) => {
                    for root in watcher.attach_pending_roots() {
                        crate::log_event!("pipeline", "root attached", "{}", root.display());
                    }
                    match self.reconcile_events().await {
                        Ok(found) => self.feed(&mut debouncer, found),
                        Err(e) => tracing::warn!("[pipeline] rescan failed: {e}"),
                    }
                }
            }
        }

        self.shutdown(watcher, events, debouncer, reembed).await
    }

    async fn shutdown(
        &self,
        watcher: PathWatcher,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        mut debouncer: Debouncer,
        reembed: Option<JoinHandle<()>>,
    ) -> Result<SchedulerSnapshot, PipelineError> {
        crate::log_event!("pipeline", "stopping");
        watcher.stop();

        while let Ok(event) = events.try_recv() {
            if let Some(stable) = debouncer.record(event) {
                self.scheduler.submit(stable);
            }
        }
        for stable in debouncer.drain() {
            self.scheduler.submit(stable);
        }

        let finished = self
            .scheduler
            .shutdown(self.settings.pipeline.shutdown_grace())
            .await;

        if let Some(handle) = reembed {
            handle
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))?;
        }

        let stats = self.scheduler.stats();
        crate::log_event!(
            "pipeline",
            "stopped",
            "{} stored, {} unchanged, {} superseded, {} failed{}",
            stats.completed,
            stats.unchanged,
            stats.superseded,
            stats.failed,
            if finished { "" } else { " (grace period expired)" }
        );
        Ok(stats)
    }

    fn feed(&self, debouncer: &mut Debouncer, events: Vec<WatchEvent>) {
        if !events.is_empty() {
            crate::debug_event!("pipeline", "reconcile", "{} events", events.len());
        }
        for event in events {
            if let Some(stable) = debouncer.record(event) {
                self.scheduler.submit(stable);
            }
        }
    }

    /// Record one live event, then hand over every path that has settled.
    fn handle_event(&self, debouncer: &mut Debouncer, event: WatchEvent) {
        if let Some(stable) = debouncer.record(event) {
            self.scheduler.submit(stable);
        }
        self.flush_ready(debouncer);
    }

    fn flush_ready(&self, debouncer: &mut Debouncer) {
        for stable in debouncer.take_ready() {
            self.scheduler.submit(stable);
        }
    }

    fn spawn_reembed(&self, cancel: &CancellationToken) -> Option<JoinHandle<()>> {
        let seconds = self.settings.embedding.reembed_interval_seconds;
        if seconds == 0 {
            return None;
        }
        Some(tokio::spawn(semantic::reembed::run(
            self.store.clone(),
            self.embedder.clone(),
            self.identity.project_id.clone(),
            self.settings.embedding.batch_size,
            RetryPolicy::from_config(&self.settings.pipeline),
            Duration::from_secs(seconds),
            cancel.child_token(),
        )))
    }
}

async fn next_tick(interval: &mut Option<tokio::time::Interval>) -> Option<tokio::time::Instant> {
    match interval {
        Some(interval) => Some(interval.tick().await),
        None => std::future::pending().await,
    }
}
