//! The rolling activity window.
//!
//! Holds the recent speed samples and key intervals derived from the input
//! stream. Samples older than the configured window length (measured back from
//! the newest accepted event, or from the evaluation time) are evicted.

use crate::collector::types::{InputEvent, KeyPress, PointerMove};
use crate::core::features::{KeyTimingSummary, RollingDispersion, SpeedSummary};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Why an event was not added to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Earlier than the previous event of the same kind
    OutOfOrder,
    /// Non-finite coordinates
    Malformed,
}

/// Result of feeding one event to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    Accepted,
    Discarded(DiscardReason),
}

/// Bounded, time-ordered view of recent input activity.
#[derive(Debug, Clone)]
pub struct ActivityWindow {
    length: Duration,
    last_pointer: Option<PointerMove>,
    last_key: Option<KeyPress>,
    newest: Option<DateTime<Utc>>,
    speeds: RollingDispersion,
    key_intervals: RollingDispersion,
}

impl ActivityWindow {
    pub fn new(length: std::time::Duration) -> Self {
        Self {
            length: to_chrono(length),
            last_pointer: None,
            last_key: None,
            newest: None,
            speeds: RollingDispersion::new(),
            key_intervals: RollingDispersion::new(),
        }
    }

    pub fn set_length(&mut self, length: std::time::Duration) {
        self.length = to_chrono(length);
        if let Some(newest) = self.newest {
            self.evict(newest);
        }
    }

    /// Add an event, deriving a speed sample or key interval from its
    /// predecessor of the same kind.
    pub fn observe(&mut self, event: InputEvent) -> ObserveOutcome {
        let outcome = match event {
            InputEvent::PointerMove(movement) => self.observe_pointer(movement),
            InputEvent::KeyPress(press) => self.observe_key(press),
        };
        if outcome == ObserveOutcome::Accepted {
            let ts = event.timestamp();
            if self.newest.map_or(true, |newest| ts > newest) {
                self.newest = Some(ts);
            }
            if let Some(newest) = self.newest {
                self.evict(newest);
            }
        }
        outcome
    }

    fn observe_pointer(&mut self, movement: PointerMove) -> ObserveOutcome {
        if !movement.x.is_finite() || !movement.y.is_finite() {
            return ObserveOutcome::Discarded(DiscardReason::Malformed);
        }
        if let Some(previous) = self.last_pointer {
            let elapsed = movement.timestamp - previous.timestamp;
            if elapsed < Duration::zero() {
                return ObserveOutcome::Discarded(DiscardReason::OutOfOrder);
            }
            let secs = seconds(elapsed);
            // Zero elapsed time carries no speed information.
            if secs > 0.0 {
                let speed = previous.distance_to(&movement) / secs;
                self.speeds.push(movement.timestamp, speed);
            }
        }
        self.last_pointer = Some(movement);
        ObserveOutcome::Accepted
    }

    fn observe_key(&mut self, press: KeyPress) -> ObserveOutcome {
        if let Some(previous) = self.last_key {
            let elapsed = press.timestamp - previous.timestamp;
            if elapsed < Duration::zero() {
                return ObserveOutcome::Discarded(DiscardReason::OutOfOrder);
            }
            self.key_intervals.push(press.timestamp, seconds(elapsed));
        }
        self.last_key = Some(press);
        ObserveOutcome::Accepted
    }

    /// Evict samples that fell out of the window as of `now`.
    pub fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.length;
        self.speeds.evict_before(cutoff);
        self.key_intervals.evict_before(cutoff);
    }

    pub fn speed_summary(&self) -> SpeedSummary {
        SpeedSummary {
            samples: self.speeds.len(),
            max_speed: self.speeds.max(),
            mean_speed: self.speeds.mean(),
        }
    }

    pub fn key_timing_summary(&self) -> KeyTimingSummary {
        let samples = self.key_intervals.len();
        let interval_std_dev = if samples >= 2 {
            Some(self.key_intervals.values().collect::<Vec<_>>().std_dev())
        } else {
            None
        };
        KeyTimingSummary {
            samples,
            mean_interval: self.key_intervals.mean(),
            interval_range: self.key_intervals.range(),
            interval_std_dev,
        }
    }

    /// Forget speed samples once they have been reported.
    pub fn clear_pointer_samples(&mut self) {
        self.speeds.clear();
    }

    /// Forget key intervals once they have been reported.
    pub fn clear_key_samples(&mut self) {
        self.key_intervals.clear();
    }

    pub fn length_secs(&self) -> f64 {
        seconds(self.length)
    }
}

fn seconds(d: Duration) -> f64 {
    d.num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or_else(|| d.num_milliseconds() as f64 / 1000.0)
}

fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(1))
}
