//! Errors that can stop the agent.
//!
//! Each concern defines its own error type next to the code that raises it.
//! Most of them are handled where they occur (a failed capture skips one
//! cycle, a failed transfer is retried). [`AgentError`] collects the ones
//! that can abort start-up.

pub use crate::capture::CaptureError;
pub use crate::collector::CollectorError;
pub use crate::config::ConfigError;
pub use crate::queue::QueueError;
pub use crate::remote::TransferError;
pub use crate::storage::StorageError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("collector error: {0}")]
    Collector(#[from] CollectorError),
    #[error("local storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("remote store error: {0}")]
    Transfer(#[from] TransferError),
    #[error("remote store not configured: set {0}")]
    RemoteUnconfigured(String),
    #[error("no usable credentials after {attempts} checks: {last_error}")]
    NoCredentials { attempts: u32, last_error: String },
    #[error("task failed: {0}")]
    Task(String),
}
