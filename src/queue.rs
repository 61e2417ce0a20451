//! The upload queue.
//!
//! Entries live in an arena keyed by [`ArtifactId`] and move through an
//! explicit state machine:
//!
//! ```text
//! pending ──▶ in-flight ──▶ uploaded
//!    ▲            │
//!    └── retry ───┤
//!                 └──────▶ failed-permanently
//! ```
//!
//! All state sits behind one mutex, so a due entry is handed to exactly one
//! worker. Workers sleep on a [`Notify`] until an entry becomes due, the
//! queue is resumed, or shutdown is requested.

use crate::artifact::{Artifact, ArtifactId};
use crate::config::{OverflowPolicy, Settings, SharedSettings};
use crate::remote::TransferError;
use crate::shutdown::Shutdown;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// Terminal entries remembered for idempotent re-enqueue.
const TERMINAL_HISTORY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InFlight,
    Uploaded,
    FailedPermanently,
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Uploaded | EntryState::FailedPermanently)
    }
}

/// An artifact plus its retry state.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub artifact: Artifact,
    pub state: EntryState,
    pub backoff_level: u32,
    pub next_attempt_at: Instant,
    /// Restored from local storage rather than freshly produced
    pub recovered: bool,
    pub last_error: Option<String>,
    seq: u64,
}

/// Exponential backoff with a cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Delay before the next attempt at `level` (1 after the first failure).
    pub fn delay(&self, level: u32) -> Duration {
        if level == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(level - 1).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for BackoffPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            base: settings.backoff_base,
            cap: settings.backoff_cap,
            multiplier: settings.backoff_multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Live (pending + in-flight) entries allowed before the overflow policy applies
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for QueueConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            capacity: settings.queue_capacity.max(1),
            overflow: settings.overflow_policy,
            max_attempts: settings.max_attempts.max(1),
            backoff: BackoffPolicy::from(settings),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("upload queue full ({capacity} entries)")]
    Overflow { capacity: usize },
    #[error("upload queue closed")]
    Closed,
    #[error("artifact {0} is not in flight")]
    NotInFlight(ArtifactId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after evicting the oldest pending entry
    QueuedEvicting(ArtifactId),
    /// The id is already tracked; nothing was added
    AlreadyKnown(EntryState),
}

/// What happened to an entry after a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled { attempts: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// A due entry handed to a worker.
#[derive(Debug, Clone)]
pub struct Lease {
    pub artifact: Artifact,
    pub recovered: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub uploaded: u64,
    pub failed: u64,
    pub evicted: u64,
}

#[derive(Debug)]
struct Inner {
    config: QueueConfig,
    live: HashMap<ArtifactId, QueueEntry>,
    finished: HashMap<ArtifactId, EntryState>,
    finished_order: VecDeque<ArtifactId>,
    next_seq: u64,
    closed: bool,
    stats: QueueStats,
}

impl Inner {
    fn state_of(&self, id: &ArtifactId) -> Option<EntryState> {
        self.live
            .get(id)
            .map(|e| e.state)
            .or_else(|| self.finished.get(id).copied())
    }

    fn is_full(&self) -> bool {
        self.live.len() >= self.config.capacity
    }

    fn oldest_pending(&self) -> Option<ArtifactId> {
        self.live
            .values()
            .filter(|e| e.state == EntryState::Pending)
            .min_by_key(|e| e.seq)
            .map(|e| e.artifact.id)
    }

    fn insert(&mut self, artifact: Artifact, recovered: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(
            artifact.id,
            QueueEntry {
                artifact,
                state: EntryState::Pending,
                backoff_level: 0,
                next_attempt_at: Instant::now(),
                recovered,
                last_error: None,
                seq,
            },
        );
        self.stats.pending += 1;
    }

    fn in_flight_mut(&mut self, id: &ArtifactId) -> Result<&mut QueueEntry, QueueError> {
        match self.live.get_mut(id) {
            Some(entry) if entry.state == EntryState::InFlight => Ok(entry),
            _ => Err(QueueError::NotInFlight(*id)),
        }
    }

    fn finish(&mut self, id: ArtifactId, state: EntryState) {
        if self.live.remove(&id).is_some() {
            self.stats.in_flight -= 1;
        }
        match state {
            EntryState::Uploaded => self.stats.uploaded += 1,
            EntryState::FailedPermanently => self.stats.failed += 1,
            _ => {}
        }
        self.finished.insert(id, state);
        self.finished_order.push_back(id);
        while self.finished_order.len() > TERMINAL_HISTORY {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }

    /// Earliest pending entry; due ones first, ties by insertion order.
    fn next_candidate(&self) -> Option<(ArtifactId, Instant)> {
        self.live
            .values()
            .filter(|e| e.state == EntryState::Pending)
            .min_by_key(|e| (e.next_attempt_at, e.seq))
            .map(|e| (e.artifact.id, e.next_attempt_at))
    }
}

/// Shared work queue between the producer and the upload workers.
#[derive(Debug)]
pub struct UploadQueue {
    inner: Mutex<Inner>,
    /// Wakes workers waiting for a due entry
    work: Notify,
    /// Wakes producers blocked on capacity
    space: Notify,
    paused: watch::Sender<bool>,
}

impl UploadQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                config,
                live: HashMap::new(),
                finished: HashMap::new(),
                finished_order: VecDeque::new(),
                next_seq: 0,
                closed: false,
                stats: QueueStats::default(),
            }),
            work: Notify::new(),
            space: Notify::new(),
            paused,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> QueueConfig {
        self.lock().config.clone()
    }

    pub fn update_config(&self, config: QueueConfig) {
        let mut inner = self.lock();
        if inner.config != config {
            tracing::debug!(?config, "upload queue config updated");
            inner.config = config;
        }
        drop(inner);
        self.space.notify_waiters();
    }

    /// Add a freshly produced artifact, applying the overflow policy.
    ///
    /// Under [`OverflowPolicy::Block`] this waits for capacity and returns
    /// [`QueueError::Closed`] if shutdown is requested first.
    pub async fn enqueue(
        &self,
        artifact: Artifact,
        shutdown: &mut Shutdown,
    ) -> Result<EnqueueOutcome, QueueError> {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(QueueError::Closed);
                }
                if let Some(state) = inner.state_of(&artifact.id) {
                    return Ok(EnqueueOutcome::AlreadyKnown(state));
                }

                let outcome = if !inner.is_full() {
                    Some(EnqueueOutcome::Queued)
                } else {
                    match inner.config.overflow {
                        OverflowPolicy::Reject => {
                            return Err(QueueError::Overflow {
                                capacity: inner.config.capacity,
                            })
                        }
                        OverflowPolicy::DropOldest => match inner.oldest_pending() {
                            Some(oldest) => {
                                inner.live.remove(&oldest);
                                inner.stats.pending -= 1;
                                inner.stats.evicted += 1;
                                Some(EnqueueOutcome::QueuedEvicting(oldest))
                            }
                            // Everything is in flight; those slots free up shortly.
                            None => Some(EnqueueOutcome::Queued),
                        },
                        OverflowPolicy::Block => None,
                    }
                };

                if let Some(outcome) = outcome {
                    inner.insert(artifact, false);
                    drop(inner);
                    self.work.notify_waiters();
                    return Ok(outcome);
                }
            }

            tokio::select! {
                _ = &mut space => {}
                _ = shutdown.requested() => return Err(QueueError::Closed),
            }
        }
    }

    /// Re-add an artifact found in local storage.
    ///
    /// Never evicts: when the queue is full the artifact stays on disk and a
    /// later scan picks it up.
    pub fn restore(&self, artifact: Artifact) -> Result<EnqueueOutcome, QueueError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        if let Some(state) = inner.state_of(&artifact.id) {
            return Ok(EnqueueOutcome::AlreadyKnown(state));
        }
        if inner.is_full() {
            return Err(QueueError::Overflow {
                capacity: inner.config.capacity,
            });
        }
        inner.insert(artifact, true);
        drop(inner);
        self.work.notify_waiters();
        Ok(EnqueueOutcome::Queued)
    }

    /// Whether another entry fits without applying the overflow policy.
    pub fn has_room(&self) -> bool {
        !self.lock().is_full()
    }

    /// Take the next due entry, waiting until one is due.
    ///
    /// Returns `None` once shutdown is requested or the queue is closed.
    pub async fn next_due(&self, shutdown: &mut Shutdown) -> Option<Lease> {
        loop {
            if shutdown.is_requested() {
                return None;
            }

            let work = self.work.notified();
            tokio::pin!(work);
            work.as_mut().enable();

            let wake_at = {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                if *self.paused.borrow() {
                    None
                } else {
                    match inner.next_candidate() {
                        Some((id, due)) if due <= Instant::now() => {
                            if let Some(entry) = inner.live.get_mut(&id) {
                                entry.state = EntryState::InFlight;
                                let lease = Lease {
                                    artifact: entry.artifact.clone(),
                                    recovered: entry.recovered,
                                };
                                inner.stats.pending -= 1;
                                inner.stats.in_flight += 1;
                                return Some(lease);
                            }
                            None
                        }
                        Some((_, due)) => Some(due),
                        None => None,
                    }
                }
            };

            match wake_at {
                Some(due) => {
                    tokio::select! {
                        _ = &mut work => {}
                        _ = tokio::time::sleep_until(due) => {}
                        _ = shutdown.requested() => return None,
                    }
                }
                None => {
                    tokio::select! {
                        _ = &mut work => {}
                        _ = shutdown.requested() => return None,
                    }
                }
            }
        }
    }

    /// In-flight → uploaded.
    pub fn complete(&self, id: ArtifactId) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.in_flight_mut(&id)?;
        inner.finish(id, EntryState::Uploaded);
        drop(inner);
        self.space.notify_waiters();
        Ok(())
    }

    /// In-flight → pending with backoff, or failed-permanently once the
    /// attempt budget is spent.
    pub fn retry(&self, id: ArtifactId, error: &TransferError) -> Result<RetryOutcome, QueueError> {
        let mut inner = self.lock();
        let max_attempts = inner.config.max_attempts;
        let backoff = inner.config.backoff;

        let entry = inner.in_flight_mut(&id)?;
        entry.artifact.attempts += 1;
        entry.last_error = Some(error.to_string());
        let attempts = entry.artifact.attempts;

        if attempts >= max_attempts {
            inner.finish(id, EntryState::FailedPermanently);
            drop(inner);
            self.space.notify_waiters();
            return Ok(RetryOutcome::Exhausted { attempts });
        }

        entry.backoff_level += 1;
        let delay = backoff.delay(entry.backoff_level);
        entry.next_attempt_at = Instant::now() + delay;
        entry.state = EntryState::Pending;
        inner.stats.in_flight -= 1;
        inner.stats.pending += 1;
        drop(inner);
        self.work.notify_waiters();
        Ok(RetryOutcome::Scheduled { attempts, delay })
    }

    /// In-flight → failed-permanently without further attempts.
    pub fn fail(&self, id: ArtifactId, error: &TransferError) -> Result<u32, QueueError> {
        let mut inner = self.lock();
        let entry = inner.in_flight_mut(&id)?;
        entry.artifact.attempts += 1;
        entry.last_error = Some(error.to_string());
        let attempts = entry.artifact.attempts;
        inner.finish(id, EntryState::FailedPermanently);
        drop(inner);
        self.space.notify_waiters();
        Ok(attempts)
    }

    /// Hand an in-flight entry back untouched and pause every worker until
    /// [`resume`](Self::resume). Used for credential failures.
    pub fn suspend(&self, id: ArtifactId, error: &TransferError) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let entry = inner.in_flight_mut(&id)?;
        entry.state = EntryState::Pending;
        entry.next_attempt_at = Instant::now();
        entry.last_error = Some(error.to_string());
        inner.stats.in_flight -= 1;
        inner.stats.pending += 1;
        drop(inner);
        self.pause();
        Ok(())
    }

    /// Hand an in-flight entry back untouched, e.g. when a worker stops
    /// before attempting it.
    pub fn release(&self, id: ArtifactId) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let entry = inner.in_flight_mut(&id)?;
        entry.state = EntryState::Pending;
        inner.stats.in_flight -= 1;
        inner.stats.pending += 1;
        drop(inner);
        self.work.notify_waiters();
        Ok(())
    }

    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            tracing::warn!("upload workers paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            tracing::info!("upload workers resumed");
        }
        self.work.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn subscribe_paused(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    /// Stop handing out work and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.work.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn state(&self, id: &ArtifactId) -> Option<EntryState> {
        self.lock().state_of(id)
    }

    pub fn entry(&self, id: &ArtifactId) -> Option<QueueEntry> {
        self.lock().live.get(id).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    /// Live entries (pending or in flight).
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keep the queue's limits in line with the current settings snapshot.
pub async fn follow_settings(
    queue: std::sync::Arc<UploadQueue>,
    settings: SharedSettings,
    mut shutdown: Shutdown,
) {
    let mut updates = settings.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let config = QueueConfig::from(&**updates.borrow_and_update());
                queue.update_config(config);
            }
        }
    }
}
