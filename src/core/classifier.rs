//! Scripted-activity classifier.
//!
//! Two heuristics run over the rolling [`ActivityWindow`]:
//!
//! - **Pointer speed**: the moving maximum of point-to-point speed. Movement
//!   faster than `pointer_speed_threshold` is not something a hand on a mouse
//!   produces.
//! - **Key timing**: the spread (max − min) of inter-key intervals. Once at
//!   least `min_key_samples` intervals are in the window, a spread below
//!   `key_dispersion_threshold` means metronome-regular typing.
//!
//! When both trigger in the same evaluation the verdict reports
//! [`SuspicionReason::HighPointerSpeed`]. The samples behind a positive
//! finding are cleared afterwards so one burst is reported once.

use crate::collector::types::InputEvent;
use crate::config::Settings;
use crate::core::features::{KeyTimingSummary, SpeedSummary};
use crate::core::windowing::{ActivityWindow, ObserveOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Thresholds the classifier runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    /// Points per second
    pub pointer_speed_threshold: f64,
    /// Seconds
    pub key_dispersion_threshold: f64,
    pub min_key_samples: usize,
    pub window: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ClassifierConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            pointer_speed_threshold: settings.pointer_speed_threshold,
            key_dispersion_threshold: settings.key_dispersion_threshold,
            min_key_samples: settings.min_key_samples,
            window: settings.activity_window,
        }
    }
}

/// Why a verdict is (or is not) suspicious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    HighPointerSpeed,
    RegularKeyTiming,
    None,
}

impl SuspicionReason {
    /// Short activity label used in detection logs.
    pub fn activity_label(&self) -> &'static str {
        match self {
            SuspicionReason::HighPointerSpeed => "pointer movement",
            SuspicionReason::RegularKeyTiming => "keyboard input",
            SuspicionReason::None => "no",
        }
    }
}

/// Statistics a verdict was based on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub pointer: SpeedSummary,
    pub keys: KeyTimingSummary,
    pub pointer_speed_threshold: f64,
    pub key_dispersion_threshold: f64,
    pub min_key_samples: usize,
    pub window_secs: f64,
    /// Events dropped as malformed or out of order since start
    pub discarded_events: u64,
}

/// Result of one evaluation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_suspicious: bool,
    pub reason: SuspicionReason,
    pub evidence: Evidence,
    pub evaluated_at: DateTime<Utc>,
}

/// Turns the input stream into verdicts.
#[derive(Debug)]
pub struct ActivityClassifier {
    config: ClassifierConfig,
    window: ActivityWindow,
    discarded: u64,
}

impl ActivityClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        let window = ActivityWindow::new(config.window);
        Self {
            config,
            window,
            discarded: 0,
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Apply new thresholds; the window keeps its samples.
    pub fn update_config(&mut self, config: ClassifierConfig) {
        if config.window != self.config.window {
            self.window.set_length(config.window);
        }
        self.config = config;
    }

    /// Feed one event. Malformed or out-of-order events are dropped and counted.
    pub fn observe(&mut self, event: InputEvent) -> ObserveOutcome {
        let outcome = self.window.observe(event);
        if let ObserveOutcome::Discarded(reason) = outcome {
            self.discarded += 1;
            tracing::debug!(?reason, timestamp = %event.timestamp(), "input event discarded");
        }
        outcome
    }

    pub fn discarded_events(&self) -> u64 {
        self.discarded
    }

    /// Judge the current window as of `now`.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Verdict {
        self.window.evict(now);

        let pointer = self.window.speed_summary();
        let keys = self.window.key_timing_summary();

        let fast_pointer = pointer.samples >= 1
            && pointer
                .max_speed
                .is_some_and(|speed| speed > self.config.pointer_speed_threshold);

        let regular_keys = keys.samples >= self.config.min_key_samples.max(1)
            && keys
                .interval_range
                .is_some_and(|range| range < self.config.key_dispersion_threshold);

        let reason = if fast_pointer {
            SuspicionReason::HighPointerSpeed
        } else if regular_keys {
            SuspicionReason::RegularKeyTiming
        } else {
            SuspicionReason::None
        };

        let evidence = Evidence {
            pointer,
            keys,
            pointer_speed_threshold: self.config.pointer_speed_threshold,
            key_dispersion_threshold: self.config.key_dispersion_threshold,
            min_key_samples: self.config.min_key_samples,
            window_secs: self.window.length_secs(),
            discarded_events: self.discarded,
        };

        if fast_pointer {
            self.window.clear_pointer_samples();
        }
        if regular_keys {
            self.window.clear_key_samples();
        }

        Verdict {
            is_suspicious: reason != SuspicionReason::None,
            reason,
            evidence,
            evaluated_at: now,
        }
    }
}

/// Counters the classifier task reports through.
pub trait ClassifierObserver: Send + Sync {
    fn event_observed(&self, event: &InputEvent, outcome: ObserveOutcome);
    fn verdict(&self, verdict: &Verdict);
}

/// Owns the classifier: applies events as they arrive, evaluates on the
/// configured period, and forwards positive verdicts to the producer.
pub async fn run_classifier(
    mut events: mpsc::Receiver<InputEvent>,
    verdicts: mpsc::Sender<Verdict>,
    settings: crate::config::SharedSettings,
    clock: crate::clock::SharedClock,
    observer: std::sync::Arc<dyn ClassifierObserver>,
    mut shutdown: crate::shutdown::Shutdown,
) {
    let initial = settings.current();
    let mut classifier = ActivityClassifier::new(ClassifierConfig::from(initial.as_ref()));
    let mut period = initial.evaluate_interval;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.requested() => break,
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else { break };
                let outcome = classifier.observe(event);
                observer.event_observed(&event, outcome);
            }
            _ = ticker.tick() => {
                let snapshot = settings.current();
                let config = ClassifierConfig::from(snapshot.as_ref());
                if &config != classifier.config() {
                    classifier.update_config(config);
                }
                if snapshot.evaluate_interval != period {
                    period = snapshot.evaluate_interval;
                    ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                }
                if snapshot.paused {
                    continue;
                }

                let verdict = classifier.evaluate(clock.now_utc());
                observer.verdict(&verdict);
                if verdict.is_suspicious {
                    tracing::warn!(
                        reason = ?verdict.reason,
                        max_speed = ?verdict.evidence.pointer.max_speed,
                        key_range = ?verdict.evidence.keys.interval_range,
                        "scripted activity suspected"
                    );
                    if verdicts.try_send(verdict).is_err() {
                        tracing::warn!("verdict channel full or closed; detection log skipped");
                    }
                }
            }
        }
    }
    tracing::debug!("classifier stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn at(base: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
        base + ChronoDuration::milliseconds(ms)
    }

    fn classifier() -> ActivityClassifier {
        ActivityClassifier::new(ClassifierConfig {
            pointer_speed_threshold: 1000.0,
            key_dispersion_threshold: 0.05,
            min_key_samples: 5,
            window: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_empty_window_is_not_suspicious() {
        let mut c = classifier();
        let verdict = c.evaluate(Utc::now());
        assert!(!verdict.is_suspicious);
        assert_eq!(verdict.reason, SuspicionReason::None);
    }

    #[test]
    fn test_single_pointer_sample_is_insufficient() {
        let mut c = classifier();
        let base = Utc::now();
        c.observe(InputEvent::pointer(0.0, 0.0, base));
        assert!(!c.evaluate(at(base, 10)).is_suspicious);
    }

    #[test]
    fn test_fast_pointer_flagged() {
        let mut c = classifier();
        let base = Utc::now();
        c.observe(InputEvent::pointer(0.0, 0.0, base));
        // 500 points in 100 ms = 5000 points/s
        c.observe(InputEvent::pointer(300.0, 400.0, at(base, 100)));
        let verdict = c.evaluate(at(base, 200));
        assert!(verdict.is_suspicious);
        assert_eq!(verdict.reason, SuspicionReason::HighPointerSpeed);
        assert!(verdict.evidence.pointer.max_speed.unwrap() > 1000.0);

        // The same burst is not reported twice.
        assert!(!c.evaluate(at(base, 300)).is_suspicious);
    }

    #[test]
    fn test_human_activity_not_flagged() {
        let mut c = classifier();
        let base = Utc::now();
        // Slow pointer: 10 points every 100 ms = 100 points/s
        for i in 0..20 {
            c.observe(InputEvent::pointer(i as f64 * 10.0, 0.0, at(base, i * 100)));
        }
        // Irregular typing
        let mut t = 0;
        for gap in [120, 340, 90, 410, 200, 150, 600] {
            t += gap;
            c.observe(InputEvent::key(3, at(base, t)));
        }
        let verdict = c.evaluate(at(base, 2_000));
        assert!(!verdict.is_suspicious);
        assert_eq!(verdict.evidence.keys.samples, 6);
    }

    #[test]
    fn test_constant_key_spacing_flagged() {
        let mut c = classifier();
        let base = Utc::now();
        for i in 0..10 {
            c.observe(InputEvent::key(0, at(base, i * 50)));
        }
        let verdict = c.evaluate(at(base, 500));
        assert!(verdict.is_suspicious);
        assert_eq!(verdict.reason, SuspicionReason::RegularKeyTiming);
        assert!(verdict.evidence.keys.interval_range.unwrap() < 1e-9);
    }

    #[test]
    fn test_jittered_key_spacing_not_flagged() {
        let mut c = classifier();
        let base = Utc::now();
        let jitter = [0, 40, -30, 70, -10, 55, -45, 20, 65];
        let mut t = 0;
        c.observe(InputEvent::key(0, at(base, t)));
        for j in jitter {
            t += 50 + j + 40;
            c.observe(InputEvent::key(0, at(base, t)));
        }
        let verdict = c.evaluate(at(base, t + 10));
        assert!(verdict.evidence.keys.interval_range.unwrap() > 0.05);
        assert!(!verdict.is_suspicious);
    }

    #[test]
    fn test_short_regular_burst_not_flagged() {
        let mut c = classifier();
        let base = Utc::now();
        // 4 intervals, below the minimum of 5
        for i in 0..5 {
            c.observe(InputEvent::key(0, at(base, i * 50)));
        }
        assert!(!c.evaluate(at(base, 300)).is_suspicious);
    }

    #[test]
    fn test_pointer_wins_tie() {
        let mut c = classifier();
        let base = Utc::now();
        for i in 0..10 {
            c.observe(InputEvent::key(0, at(base, i * 50)));
        }
        c.observe(InputEvent::pointer(0.0, 0.0, at(base, 100)));
        c.observe(InputEvent::pointer(2000.0, 0.0, at(base, 200)));
        let verdict = c.evaluate(at(base, 500));
        assert_eq!(verdict.reason, SuspicionReason::HighPointerSpeed);
    }

    #[test]
    fn test_discarded_events_counted() {
        let mut c = classifier();
        let base = Utc::now();
        c.observe(InputEvent::key(0, at(base, 100)));
        c.observe(InputEvent::key(0, base));
        assert_eq!(c.discarded_events(), 1);
        assert_eq!(c.evaluate(at(base, 200)).evidence.discarded_events, 1);
    }

    #[test]
    fn test_threshold_update_applies() {
        let mut c = classifier();
        let base = Utc::now();
        c.observe(InputEvent::pointer(0.0, 0.0, base));
        c.observe(InputEvent::pointer(50.0, 0.0, at(base, 100)));
        let mut config = c.config().clone();
        config.pointer_speed_threshold = 100.0;
        c.update_config(config);
        assert!(c.evaluate(at(base, 150)).is_suspicious);
    }
}
