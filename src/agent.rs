//! Coordination.
//!
//! [`Agent`] owns the shared pieces (settings snapshot, clock, upload queue,
//! staging directory) and runs every task until shutdown:
//!
//! ```text
//! collector ─▶ forwarder ─▶ classifier ─▶ producer ─▶ queue ─▶ workers ─▶ remote
//!                                            ▲                   │
//!                              timer ────────┘       credential monitor
//! settings poller, timezone watch, queue limits follower, staging refill
//! ```
//!
//! Tasks talk only through channels, the queue, and the settings snapshot.

use crate::artifact::Artifact;
use crate::capture::ScreenCapture;
use crate::clock::{watch_timezone, SharedClock};
use crate::collector::{spawn_forwarder, InputEvent, EVENT_CHANNEL_CAPACITY};
use crate::config::{poll_settings, Settings, SettingsProvider, SharedSettings};
use crate::core::{run_classifier, ClassifierObserver};
use crate::error::AgentError;
use crate::producer::ArtifactProducer;
use crate::queue::{follow_settings, EnqueueOutcome, QueueConfig, QueueStats, UploadQueue};
use crate::remote::RemoteStore;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::storage::LocalStore;
use crate::transparency::SharedTransparencyLog;
use crate::uploader::{monitor_credentials, verify_credentials, UploadWorker};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const VERDICT_CHANNEL_CAPACITY: usize = 64;

/// Everything the agent needs from outside.
pub struct AgentParts {
    pub settings: Settings,
    pub provider: Arc<dyn SettingsProvider>,
    pub clock: SharedClock,
    pub remote: Arc<dyn RemoteStore>,
    pub capture: Arc<dyn ScreenCapture>,
    pub transparency: SharedTransparencyLog,
}

/// What a finished run left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Artifacts re-queued from local storage at start-up
    pub recovered: usize,
    /// Entries still pending when the agent stopped; their staged copies remain
    pub left_pending: usize,
    pub queue: QueueStats,
}

pub struct Agent {
    settings: SharedSettings,
    provider: Arc<dyn SettingsProvider>,
    clock: SharedClock,
    store: LocalStore,
    queue: Arc<UploadQueue>,
    remote: Arc<dyn RemoteStore>,
    capture: Arc<dyn ScreenCapture>,
    transparency: SharedTransparencyLog,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
}

impl Agent {
    pub fn new(parts: AgentParts) -> Result<Self, AgentError> {
        parts.settings.validate()?;
        parts.settings.ensure_directories()?;
        let store = LocalStore::open(&parts.settings.staging_path)?;
        let queue = Arc::new(UploadQueue::new(QueueConfig::from(&parts.settings)));
        let (trigger, shutdown) = shutdown::channel();

        Ok(Self {
            settings: SharedSettings::new(parts.settings),
            provider: parts.provider,
            clock: parts.clock,
            store,
            queue,
            remote: parts.remote,
            capture: parts.capture,
            transparency: parts.transparency,
            trigger,
            shutdown,
        })
    }

    /// Handle for requesting a graceful stop, e.g. from a signal handler.
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    pub fn queue(&self) -> &Arc<UploadQueue> {
        &self.queue
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Re-queue staged artifacts not confirmed uploaded, oldest first, up to
    /// the queue's capacity. The rest wait on disk for the staging refill.
    pub fn recover(&self) -> Result<usize, AgentError> {
        let (restored, deferred) = restore_staged(&self.queue, self.store.recover()?);
        if restored > 0 || deferred > 0 {
            tracing::info!(
                count = restored,
                deferred,
                "re-queued artifacts from local storage"
            );
        }
        Ok(restored)
    }

    /// Run until shutdown is requested.
    ///
    /// Fails only at start-up: when the store rejects every credential check
    /// or the staging directory cannot be read.
    pub async fn run(
        self,
        events: crossbeam_channel::Receiver<InputEvent>,
    ) -> Result<RunSummary, AgentError> {
        let mut shutdown = self.shutdown.clone();

        verify_credentials(self.remote.as_ref(), &self.settings, &mut shutdown).await?;
        let recovered = self.recover()?;

        let tasks = self.spawn_tasks(events);
        tracing::info!(
            workers = self.settings.current().workers,
            tasks = tasks.len(),
            "agent running"
        );

        shutdown.requested().await;
        tracing::info!("shutdown requested, draining");
        self.queue.close();

        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "task ended abnormally");
            }
        }

        let summary = RunSummary {
            recovered,
            left_pending: self.queue.len(),
            queue: self.queue.stats(),
        };
        if summary.left_pending > 0 {
            tracing::info!(
                pending = summary.left_pending,
                staging = ?self.store.root(),
                "pending artifacts kept in local storage for next start"
            );
        }
        if let Err(e) = self.transparency.save() {
            tracing::warn!(error = %e, "could not save transparency log");
        }
        Ok(summary)
    }

    fn spawn_tasks(&self, events: crossbeam_channel::Receiver<InputEvent>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (verdict_tx, verdict_rx) = mpsc::channel(VERDICT_CHANNEL_CAPACITY);

        let transparency = self.transparency.clone();
        tasks.push(spawn_forwarder(
            events,
            event_tx,
            self.shutdown.clone(),
            move |dropped| transparency.record_dropped_events(dropped),
        ));

        let observer: Arc<dyn ClassifierObserver> = self.transparency.clone();
        tasks.push(tokio::spawn(run_classifier(
            event_rx,
            verdict_tx,
            self.settings.clone(),
            self.clock.clone(),
            observer,
            self.shutdown.clone(),
        )));

        let producer = ArtifactProducer::new(
            self.capture.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.clock.clone(),
            self.settings.clone(),
            self.transparency.clone(),
        );
        tasks.push(tokio::spawn(producer.run(verdict_rx, self.shutdown.clone())));

        for id in 0..self.settings.current().workers {
            let worker = UploadWorker::new(
                id,
                self.queue.clone(),
                self.store.clone(),
                self.remote.clone(),
                self.settings.clone(),
                self.transparency.clone(),
            );
            tasks.push(tokio::spawn(worker.run(self.shutdown.clone())));
        }

        tasks.push(tokio::spawn(monitor_credentials(
            self.queue.clone(),
            self.remote.clone(),
            self.settings.clone(),
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(poll_settings(
            self.provider.clone(),
            self.settings.clone(),
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(watch_timezone(
            self.clock.clone(),
            self.settings.clone(),
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(follow_settings(
            self.queue.clone(),
            self.settings.clone(),
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(refill_from_staging(
            self.queue.clone(),
            self.store.clone(),
            self.settings.clone(),
            self.shutdown.clone(),
        )));

        tasks
    }
}

/// Offer staged artifacts to the queue until it is full.
///
/// Returns how many were queued and how many were left on disk.
fn restore_staged(queue: &UploadQueue, staged: Vec<Artifact>) -> (usize, usize) {
    let total = staged.len();
    let mut restored = 0;
    for (offered, artifact) in staged.into_iter().enumerate() {
        let id = artifact.id;
        let attempts = artifact.attempts;
        match queue.restore(artifact) {
            Ok(EnqueueOutcome::Queued) => {
                tracing::debug!(artifact_id = %id, attempt = attempts, "restored staged artifact");
                restored += 1;
            }
            Ok(_) => {}
            Err(_) => return (restored, total - offered),
        }
    }
    (restored, 0)
}

/// Feed artifacts waiting on disk back into the queue as room frees up.
///
/// Covers entries recovery could not fit and entries evicted under
/// [`OverflowPolicy::DropOldest`](crate::config::OverflowPolicy::DropOldest).
pub async fn refill_from_staging(
    queue: Arc<UploadQueue>,
    store: LocalStore,
    settings: SharedSettings,
    mut shutdown: Shutdown,
) {
    loop {
        let interval = settings.current().staging_scan_interval;
        if !shutdown.sleep(interval).await {
            break;
        }
        if !queue.has_room() {
            continue;
        }

        let scanner = store.clone();
        let staged = match tokio::task::spawn_blocking(move || scanner.scan()).await {
            Ok(Ok(staged)) => staged,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "could not scan staging directory");
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "staging scan task failed");
                continue;
            }
        };

        let (restored, deferred) = restore_staged(&queue, staged);
        if restored > 0 {
            tracing::info!(count = restored, deferred, "re-queued staged artifacts");
        }
    }
    tracing::debug!("staging refill stopped");
}
