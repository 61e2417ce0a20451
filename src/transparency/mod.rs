//! Transparency: a running account of what the agent has collected and sent.

pub mod log;

pub use log::{
    create_shared_log, create_shared_log_with_persistence, PersistedStats, SharedTransparencyLog,
    TransparencyLog, TransparencyStats,
};
