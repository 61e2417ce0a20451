//! Core detection logic.
//!
//! This module contains:
//! - Rolling statistics over timestamped samples
//! - The activity window fed by the input stream
//! - The scripted-activity classifier

pub mod classifier;
pub mod features;
pub mod windowing;

// Re-export commonly used types
pub use classifier::{
    run_classifier, ActivityClassifier, ClassifierConfig, ClassifierObserver, Evidence,
    SuspicionReason, Verdict,
};
pub use features::{KeyTimingSummary, RollingDispersion, RollingExtreme, SpeedSummary};
pub use windowing::{ActivityWindow, DiscardReason, ObserveOutcome};
