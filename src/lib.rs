//! Input Sentinel - scripted-activity detection with resilient evidence upload.
//!
//! The agent watches pointer movement and key presses, flags input that looks
//! automated rather than human, captures periodic screenshots, and ships the
//! resulting artifacts to a remote object store without losing them to
//! network or credential outages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Input Sentinel                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌────────────┐   ┌──────────┐   ┌────────────┐  │
//! │  │ Collector │──▶│ Classifier │──▶│ Producer │──▶│   Upload   │  │
//! │  │ (OS hook) │   │ (rolling)  │   │ (+timer) │   │   queue    │  │
//! │  └───────────┘   └────────────┘   └──────────┘   └────────────┘  │
//! │                                        │               │         │
//! │                                        ▼               ▼         │
//! │                                  ┌──────────┐   ┌────────────┐   │
//! │                                  │ Staging  │◀──│  Workers   │   │
//! │                                  │  (disk)  │   │ (N, retry) │   │
//! │                                  └──────────┘   └────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use input_sentinel::core::{ActivityClassifier, ClassifierConfig};
//! use input_sentinel::collector::InputEvent;
//! use chrono::Utc;
//!
//! let mut classifier = ActivityClassifier::new(ClassifierConfig::default());
//! classifier.observe(InputEvent::pointer(0.0, 0.0, Utc::now()));
//! let verdict = classifier.evaluate(Utc::now());
//! assert!(!verdict.is_suspicious);
//! ```

pub mod agent;
pub mod artifact;
pub mod capture;
pub mod clock;
pub mod collector;
pub mod config;
pub mod core;
pub mod error;
pub mod producer;
pub mod queue;
pub mod remote;
pub mod shutdown;
pub mod storage;
pub mod transparency;
pub mod uploader;

// Re-export key types at crate root for convenience
pub use agent::{Agent, AgentParts, RunSummary};
pub use artifact::{Artifact, ArtifactId, ArtifactKind, ArtifactPayload, ImageData, LogRecord};
pub use clock::{Clock, SharedClock, Timestamp};
pub use collector::{Collector, CollectorConfig, CollectorError, InputEvent};
pub use config::{
    FileSettingsProvider, OverflowPolicy, Settings, SettingsOverrides, SettingsProvider,
    SharedSettings,
};
pub use core::{ActivityClassifier, SuspicionReason, Verdict};
pub use error::AgentError;
pub use queue::{EntryState, UploadQueue};
pub use remote::{HttpObjectStore, RemoteStore, TransferError};
pub use storage::LocalStore;
pub use transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Disclosure shown at start-up and by `input-sentinel notice`.
pub const MONITORING_NOTICE: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║              INPUT SENTINEL - MONITORING NOTICE                  ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This computer runs an agent that checks for automated input.    ║
║                                                                  ║
║  ✓ WHAT IS RECORDED:                                             ║
║    • Timing of key presses and pointer movement speed            ║
║    • Periodic screenshots (resized, optionally blurred)          ║
║    • A log entry whenever input looks scripted                   ║
║                                                                  ║
║  ✗ WHAT IS NEVER RECORDED:                                       ║
║    • The text you type                                           ║
║    • A trail of your pointer positions                           ║
║                                                                  ║
║  Screenshots and logs are uploaded to the configured store.      ║
║  Until confirmed uploaded they are kept in the local staging     ║
║  directory (see `input-sentinel pending`).                       ║
║                                                                  ║
║  Collection can be paused with:                                  ║
║    input-sentinel pause                                          ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitoring_notice_contents() {
        assert!(MONITORING_NOTICE.contains("MONITORING NOTICE"));
        assert!(MONITORING_NOTICE.contains("NEVER RECORDED"));
        assert!(MONITORING_NOTICE.contains("screenshots"));
    }
}
