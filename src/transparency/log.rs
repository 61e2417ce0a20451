//! Transparency log.
//!
//! Counts what the agent observed, captured and shipped so the monitored user
//! (or an auditor) can see it with `input-sentinel status`. Only counts are
//! kept; no key identities, coordinates or image content.

use crate::collector::types::InputEvent;
use crate::core::windowing::ObserveOutcome;
use crate::core::{ClassifierObserver, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the current session, optionally carried over from earlier ones.
#[derive(Debug)]
pub struct TransparencyLog {
    pointer_events: AtomicU64,
    key_presses: AtomicU64,
    discarded_events: AtomicU64,
    /// Events dropped because the classifier fell behind
    dropped_events: AtomicU64,
    suspicious_verdicts: AtomicU64,
    screenshots_captured: AtomicU64,
    capture_failures: AtomicU64,
    artifacts_uploaded: AtomicU64,
    artifacts_failed: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    pub fn new() -> Self {
        Self {
            pointer_events: AtomicU64::new(0),
            key_presses: AtomicU64::new(0),
            discarded_events: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            suspicious_verdicts: AtomicU64::new(0),
            screenshots_captured: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            artifacts_uploaded: AtomicU64::new(0),
            artifacts_failed: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log that continues from (and saves back to) `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "could not load previous transparency stats");
        }

        log
    }

    pub fn record_pointer_event(&self) {
        self.pointer_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_press(&self) {
        self.key_presses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded_event(&self) {
        self.discarded_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_events(&self, count: u64) {
        self.dropped_events.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_suspicious_verdict(&self) {
        self.suspicious_verdicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_screenshot(&self) {
        self.screenshots_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_failure(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uploaded(&self) {
        self.artifacts_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.artifacts_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TransparencyStats {
        TransparencyStats {
            pointer_events: self.pointer_events.load(Ordering::Relaxed),
            key_presses: self.key_presses.load(Ordering::Relaxed),
            discarded_events: self.discarded_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            suspicious_verdicts: self.suspicious_verdicts.load(Ordering::Relaxed),
            screenshots_captured: self.screenshots_captured.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            artifacts_uploaded: self.artifacts_uploaded.load(Ordering::Relaxed),
            artifacts_failed: self.artifacts_failed.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary for the terminal.
    pub fn summary(&self) -> String {
        self.stats().to_string()
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                pointer_events: stats.pointer_events,
                key_presses: stats.key_presses,
                discarded_events: stats.discarded_events,
                dropped_events: stats.dropped_events,
                suspicious_verdicts: stats.suspicious_verdicts,
                screenshots_captured: stats.screenshots_captured,
                capture_failures: stats.capture_failures,
                artifacts_uploaded: stats.artifacts_uploaded,
                artifacts_failed: stats.artifacts_failed,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.pointer_events
                    .store(persisted.pointer_events, Ordering::Relaxed);
                self.key_presses
                    .store(persisted.key_presses, Ordering::Relaxed);
                self.discarded_events
                    .store(persisted.discarded_events, Ordering::Relaxed);
                self.dropped_events
                    .store(persisted.dropped_events, Ordering::Relaxed);
                self.suspicious_verdicts
                    .store(persisted.suspicious_verdicts, Ordering::Relaxed);
                self.screenshots_captured
                    .store(persisted.screenshots_captured, Ordering::Relaxed);
                self.capture_failures
                    .store(persisted.capture_failures, Ordering::Relaxed);
                self.artifacts_uploaded
                    .store(persisted.artifacts_uploaded, Ordering::Relaxed);
                self.artifacts_failed
                    .store(persisted.artifacts_failed, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Load persisted stats without creating a live log.
    pub fn read_persisted(path: &std::path::Path) -> Result<PersistedStats, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierObserver for TransparencyLog {
    fn event_observed(&self, event: &InputEvent, outcome: ObserveOutcome) {
        match event {
            InputEvent::PointerMove(_) => self.record_pointer_event(),
            InputEvent::KeyPress(_) => self.record_key_press(),
        }
        if let ObserveOutcome::Discarded(_) = outcome {
            self.record_discarded_event();
        }
    }

    fn verdict(&self, verdict: &Verdict) {
        if verdict.is_suspicious {
            self.record_suspicious_verdict();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub pointer_events: u64,
    pub key_presses: u64,
    pub discarded_events: u64,
    pub dropped_events: u64,
    pub suspicious_verdicts: u64,
    pub screenshots_captured: u64,
    pub capture_failures: u64,
    pub artifacts_uploaded: u64,
    pub artifacts_failed: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

impl std::fmt::Display for TransparencyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session Statistics:\n\
             - Pointer events observed: {}\n\
             - Key presses observed: {}\n\
             - Events discarded (malformed or out of order): {}\n\
             - Events dropped (classifier busy): {}\n\
             - Suspicious verdicts: {}\n\
             - Screenshots captured: {}\n\
             - Capture failures: {}\n\
             - Artifacts uploaded: {}\n\
             - Artifacts failed permanently: {}\n\
             - Session duration: {} seconds",
            self.pointer_events,
            self.key_presses,
            self.discarded_events,
            self.dropped_events,
            self.suspicious_verdicts,
            self.screenshots_captured,
            self.capture_failures,
            self.artifacts_uploaded,
            self.artifacts_failed,
            self.session_duration_secs
        )
    }
}

/// Stats format for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedStats {
    pub pointer_events: u64,
    pub key_presses: u64,
    #[serde(default)]
    pub discarded_events: u64,
    #[serde(default)]
    pub dropped_events: u64,
    pub suspicious_verdicts: u64,
    pub screenshots_captured: u64,
    #[serde(default)]
    pub capture_failures: u64,
    pub artifacts_uploaded: u64,
    pub artifacts_failed: u64,
    pub last_updated: DateTime<Utc>,
}

pub type SharedTransparencyLog = Arc<TransparencyLog>;

pub fn create_shared_log() -> SharedTransparencyLog {
    Arc::new(TransparencyLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedTransparencyLog {
    Arc::new(TransparencyLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::windowing::DiscardReason;
    use crate::core::{Evidence, SuspicionReason};

    #[test]
    fn test_observer_counts_events() {
        let log = TransparencyLog::new();
        let now = Utc::now();

        log.event_observed(&InputEvent::key(4, now), ObserveOutcome::Accepted);
        log.event_observed(&InputEvent::key(4, now), ObserveOutcome::Accepted);
        log.event_observed(
            &InputEvent::pointer(1.0, 1.0, now),
            ObserveOutcome::Discarded(DiscardReason::OutOfOrder),
        );

        let stats = log.stats();
        assert_eq!(stats.key_presses, 2);
        assert_eq!(stats.pointer_events, 1);
        assert_eq!(stats.discarded_events, 1);
    }

    #[test]
    fn test_only_suspicious_verdicts_counted() {
        let log = TransparencyLog::new();
        let mut verdict = Verdict {
            is_suspicious: false,
            reason: SuspicionReason::None,
            evidence: Evidence::default(),
            evaluated_at: Utc::now(),
        };
        log.verdict(&verdict);
        verdict.is_suspicious = true;
        verdict.reason = SuspicionReason::HighPointerSpeed;
        log.verdict(&verdict);

        assert_eq!(log.stats().suspicious_verdicts, 1);
    }

    #[test]
    fn test_persistence_carries_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transparency.json");

        let log = TransparencyLog::with_persistence(path.clone());
        log.record_screenshot();
        log.record_uploaded();
        log.record_uploaded();
        log.save().unwrap();

        let reloaded = TransparencyLog::with_persistence(path.clone());
        let stats = reloaded.stats();
        assert_eq!(stats.screenshots_captured, 1);
        assert_eq!(stats.artifacts_uploaded, 2);

        let persisted = TransparencyLog::read_persisted(&path).unwrap();
        assert_eq!(persisted.artifacts_uploaded, 2);
    }

    #[test]
    fn test_summary_format() {
        let summary = TransparencyLog::new().summary();
        assert!(summary.contains("Pointer events observed"));
        assert!(summary.contains("Artifacts uploaded"));
    }
}
