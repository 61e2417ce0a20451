//! Rolling statistics over timestamped samples.
//!
//! Both structures evict samples older than a cutoff from the front and add
//! new samples at the back, so each sample is pushed and popped once and all
//! updates are O(1) amortized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Which extreme a [`RollingExtreme`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extreme {
    Max,
    Min,
}

/// Sliding-window maximum or minimum using a monotonic deque.
#[derive(Debug, Clone)]
pub struct RollingExtreme {
    kind: Extreme,
    deque: VecDeque<(DateTime<Utc>, f64)>,
}

impl RollingExtreme {
    pub fn new(kind: Extreme) -> Self {
        Self {
            kind,
            deque: VecDeque::new(),
        }
    }

    fn dominates(&self, candidate: f64, existing: f64) -> bool {
        match self.kind {
            Extreme::Max => candidate >= existing,
            Extreme::Min => candidate <= existing,
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, value: f64) {
        while let Some(&(_, back)) = self.deque.back() {
            if self.dominates(value, back) {
                self.deque.pop_back();
            } else {
                break;
            }
        }
        self.deque.push_back((at, value));
    }

    /// Drop samples taken strictly before `cutoff`.
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&(at, _)) = self.deque.front() {
            if at < cutoff {
                self.deque.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.deque.front().map(|&(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.deque.clear();
    }
}

/// Sliding-window count, mean, variance, and range.
#[derive(Debug, Clone)]
pub struct RollingDispersion {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    sum: f64,
    sum_sq: f64,
    max: RollingExtreme,
    min: RollingExtreme,
}

impl Default for RollingDispersion {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingDispersion {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            sum: 0.0,
            sum_sq: 0.0,
            max: RollingExtreme::new(Extreme::Max),
            min: RollingExtreme::new(Extreme::Min),
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, value: f64) {
        self.samples.push_back((at, value));
        self.sum += value;
        self.sum_sq += value * value;
        self.max.push(at, value);
        self.min.push(at, value);
    }

    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&(at, value)) = self.samples.front() {
            if at >= cutoff {
                break;
            }
            self.samples.pop_front();
            self.sum -= value;
            self.sum_sq -= value * value;
        }
        if self.samples.is_empty() {
            // Reset accumulated float error.
            self.sum = 0.0;
            self.sum_sq = 0.0;
        }
        self.max.evict_before(cutoff);
        self.min.evict_before(cutoff);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.sum / self.samples.len() as f64)
    }

    /// Population variance of the current samples.
    pub fn variance(&self) -> Option<f64> {
        let mean = self.mean()?;
        let n = self.samples.len() as f64;
        Some((self.sum_sq / n - mean * mean).max(0.0))
    }

    /// Spread between the largest and smallest sample.
    pub fn range(&self) -> Option<f64> {
        Some(self.max.value()? - self.min.value()?)
    }

    pub fn max(&self) -> Option<f64> {
        self.max.value()
    }

    /// Sample values currently in the window, oldest first.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|&(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
        self.max.clear();
        self.min.clear();
    }
}

/// Pointer-speed statistics for one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedSummary {
    /// Speed samples (consecutive move pairs) in the window
    pub samples: usize,
    /// Moving maximum, points per second
    pub max_speed: Option<f64>,
    /// Mean speed, points per second
    pub mean_speed: Option<f64>,
}

/// Key-interval statistics for one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyTimingSummary {
    /// Inter-key intervals in the window
    pub samples: usize,
    /// Mean interval, seconds
    pub mean_interval: Option<f64>,
    /// Largest minus smallest interval, seconds
    pub interval_range: Option<f64>,
    /// Sample standard deviation of intervals, seconds
    pub interval_std_dev: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(base: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
        base + Duration::milliseconds(ms)
    }

    #[test]
    fn test_rolling_max_evicts() {
        let base = Utc::now();
        let mut max = RollingExtreme::new(Extreme::Max);
        max.push(at(base, 0), 5.0);
        max.push(at(base, 10), 3.0);
        max.push(at(base, 20), 4.0);
        assert_eq!(max.value(), Some(5.0));

        max.evict_before(at(base, 5));
        assert_eq!(max.value(), Some(4.0));

        max.evict_before(at(base, 25));
        assert_eq!(max.value(), None);
    }

    #[test]
    fn test_rolling_min() {
        let base = Utc::now();
        let mut min = RollingExtreme::new(Extreme::Min);
        min.push(at(base, 0), 2.0);
        min.push(at(base, 10), 7.0);
        min.push(at(base, 20), 1.0);
        assert_eq!(min.value(), Some(1.0));
    }

    #[test]
    fn test_dispersion_stats() {
        let base = Utc::now();
        let mut d = RollingDispersion::new();
        for (i, v) in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].iter().enumerate() {
            d.push(at(base, i as i64), *v);
        }
        assert_eq!(d.len(), 8);
        assert!((d.mean().unwrap() - 5.0).abs() < 1e-9);
        assert!((d.variance().unwrap().sqrt() - 2.0).abs() < 1e-9);
        assert_eq!(d.range(), Some(7.0));

        d.evict_before(at(base, 6));
        assert_eq!(d.len(), 2);
        assert_eq!(d.range(), Some(2.0));
        assert!((d.mean().unwrap() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_dispersion_empty() {
        let d = RollingDispersion::new();
        assert!(d.is_empty());
        assert_eq!(d.mean(), None);
        assert_eq!(d.range(), None);
    }
}
