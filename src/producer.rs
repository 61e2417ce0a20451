//! Artifact producer.
//!
//! Turns timer ticks into screenshots and positive verdicts into detection
//! logs. Every artifact is staged on disk before it is offered to the upload
//! queue, so the staged copy is always the recovery source. Nothing here
//! touches the network.

use crate::artifact::{Artifact, ArtifactId, LogRecord};
use crate::capture::{CaptureError, PrivacyTransform, ScreenCapture};
use crate::clock::SharedClock;
use crate::config::SharedSettings;
use crate::core::Verdict;
use crate::queue::{EnqueueOutcome, QueueError, UploadQueue};
use crate::shutdown::Shutdown;
use crate::storage::{LocalStore, StorageError};
use crate::transparency::SharedTransparencyLog;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("capture task failed: {0}")]
    Join(String),
}

/// What a single production step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Produced {
    /// Staged and queued
    Queued(ArtifactId),
    /// Staged, but the queue refused it; the staged copy is picked up on restart
    StagedOnly(ArtifactId),
    /// Feature toggled off or agent paused
    Skipped,
}

pub struct ArtifactProducer {
    capture: Arc<dyn ScreenCapture>,
    store: LocalStore,
    queue: Arc<UploadQueue>,
    clock: SharedClock,
    settings: SharedSettings,
    device: String,
    transparency: SharedTransparencyLog,
}

impl ArtifactProducer {
    pub fn new(
        capture: Arc<dyn ScreenCapture>,
        store: LocalStore,
        queue: Arc<UploadQueue>,
        clock: SharedClock,
        settings: SharedSettings,
        transparency: SharedTransparencyLog,
    ) -> Self {
        let device = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            capture,
            store,
            queue,
            clock,
            settings,
            device,
            transparency,
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    /// One screenshot cycle: capture, transform, stage, enqueue.
    pub async fn tick(&self, shutdown: &mut Shutdown) -> Result<Produced, ProduceError> {
        let settings = self.settings.current();
        if settings.paused || !settings.capture_screenshots {
            return Ok(Produced::Skipped);
        }

        let capture = self.capture.clone();
        let transform = PrivacyTransform::from(settings.as_ref());
        let png = tokio::task::spawn_blocking(move || {
            let raw = capture.capture()?;
            transform.apply(&raw)
        })
        .await
        .map_err(|e| ProduceError::Join(e.to_string()))?;

        let png = match png {
            Ok(png) => png,
            Err(e) => {
                self.transparency.record_capture_failure();
                return Err(e.into());
            }
        };
        self.transparency.record_screenshot();

        let artifact = Artifact::screenshot(png, &self.clock);
        self.stage_and_enqueue(artifact, shutdown).await
    }

    /// Write the detection log for a positive verdict.
    pub async fn record_verdict(
        &self,
        verdict: &Verdict,
        shutdown: &mut Shutdown,
    ) -> Result<Produced, ProduceError> {
        if !verdict.is_suspicious {
            return Ok(Produced::Skipped);
        }
        let record = LogRecord::from_verdict(verdict, &self.clock, self.device.clone());
        tracing::info!(record = %record.message(), "detection logged");
        self.stage_and_enqueue(Artifact::log_record(record), shutdown)
            .await
    }

    async fn stage_and_enqueue(
        &self,
        artifact: Artifact,
        shutdown: &mut Shutdown,
    ) -> Result<Produced, ProduceError> {
        let id = artifact.id;
        self.store.stage(&artifact)?;

        match self.queue.enqueue(artifact.into_staged(), shutdown).await {
            Ok(EnqueueOutcome::Queued) | Ok(EnqueueOutcome::AlreadyKnown(_)) => {
                tracing::debug!(artifact_id = %id, "artifact queued");
                Ok(Produced::Queued(id))
            }
            Ok(EnqueueOutcome::QueuedEvicting(evicted)) => {
                tracing::warn!(
                    artifact_id = %id,
                    evicted = %evicted,
                    error_class = "queue_overflow",
                    "upload queue full, evicted oldest pending artifact (kept on disk)"
                );
                Ok(Produced::Queued(id))
            }
            Err(e @ QueueError::Overflow { .. }) | Err(e @ QueueError::Closed) => {
                tracing::warn!(
                    artifact_id = %id,
                    error = %e,
                    error_class = "queue_overflow",
                    "artifact not queued, left staged for recovery"
                );
                Ok(Produced::StagedOnly(id))
            }
            Err(e @ QueueError::NotInFlight(_)) => {
                tracing::error!(artifact_id = %id, error = %e, "unexpected queue state");
                Ok(Produced::StagedOnly(id))
            }
        }
    }

    /// Produce until shutdown: screenshots on the configured interval and a
    /// log for every verdict that arrives.
    pub async fn run(self, mut verdicts: mpsc::Receiver<Verdict>, mut shutdown: Shutdown) {
        let mut last_tick = Instant::now();
        let mut verdicts_open = true;

        loop {
            // Re-read every cycle so an interval change applies to the next tick.
            let next_tick = last_tick + self.settings.current().screenshot_interval;

            tokio::select! {
                _ = shutdown.requested() => break,
                _ = tokio::time::sleep_until(next_tick) => {
                    last_tick = Instant::now();
                    match self.tick(&mut shutdown).await {
                        Ok(Produced::Queued(id)) => {
                            tracing::debug!(artifact_id = %id, "screenshot captured");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, error_class = "capture", "screenshot skipped");
                        }
                    }
                }
                maybe = verdicts.recv(), if verdicts_open => {
                    match maybe {
                        Some(verdict) => {
                            if let Err(e) = self.record_verdict(&verdict, &mut shutdown).await {
                                tracing::error!(error = %e, "could not stage detection log");
                            }
                        }
                        None => verdicts_open = false,
                    }
                }
            }
        }
        tracing::debug!("producer stopped");
    }
}
