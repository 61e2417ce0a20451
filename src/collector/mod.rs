//! Input event collection.
//!
//! Platform collectors push [`InputEvent`]s into a bounded channel. When the
//! channel is full new events are dropped rather than stalling the OS hook.

pub mod types;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub mod noop;

use thiserror::Error;

// Re-export commonly used types
pub use types::{InputEvent, KeyPress, PointerMove};

#[cfg(target_os = "macos")]
pub use macos::{check_permission, MacOSCollector};

/// Platform-agnostic collector type alias
#[cfg(target_os = "macos")]
pub type Collector = MacOSCollector;

#[cfg(target_os = "windows")]
pub use self::windows::{check_permission, WindowsCollector};

/// Platform-agnostic collector type alias
#[cfg(target_os = "windows")]
pub type Collector = WindowsCollector;

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub use noop::{check_permission, NoopCollector};

/// Platform-agnostic collector type alias
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub type Collector = NoopCollector;

/// Capacity of the channel between the OS hook and the agent.
pub const EVENT_CHANNEL_CAPACITY: usize = 10_000;

/// Configuration for which event sources to capture.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub capture_keyboard: bool,
    pub capture_mouse: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            capture_keyboard: true,
            capture_mouse: true,
        }
    }
}

/// Errors that can occur during event collection.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Collector is already running")]
    AlreadyRunning,
    #[error("Input Monitoring permission not granted")]
    PermissionDenied,
    #[error("Failed to create event tap")]
    TapCreationFailed,
    #[error("Failed to create run loop source")]
    RunLoopSourceFailed,
    #[error("Failed to install input hook")]
    HookInstallationFailed,
}

/// Move events from the OS hook's channel onto the classifier's channel.
///
/// Runs on a blocking thread until shutdown or until the hook side
/// disconnects. Events that do not fit in `tx` are dropped and counted
/// through `on_dropped`; the hook never waits on the classifier.
pub fn spawn_forwarder(
    rx: crossbeam_channel::Receiver<InputEvent>,
    tx: tokio::sync::mpsc::Sender<InputEvent>,
    shutdown: crate::shutdown::Shutdown,
    on_dropped: impl Fn(u64) + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    use crossbeam_channel::RecvTimeoutError;
    use tokio::sync::mpsc::error::TrySendError;

    tokio::task::spawn_blocking(move || {
        let poll = std::time::Duration::from_millis(100);
        let mut dropped = 0u64;
        while !shutdown.is_requested() {
            match rx.recv_timeout(poll) {
                Ok(event) => match tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => dropped += 1,
                    Err(TrySendError::Closed(_)) => break,
                },
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("input collector disconnected");
                    break;
                }
            }
            if dropped > 0 && rx.is_empty() {
                tracing::debug!(dropped, "input events dropped, classifier behind");
                on_dropped(dropped);
                dropped = 0;
            }
        }
        if dropped > 0 {
            on_dropped(dropped);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_forwarder_drops_when_full() {
        let (hook_tx, hook_rx) = crossbeam_channel::bounded(16);
        let (tx, mut rx) = tokio::sync::mpsc::channel(2);
        let (trigger, shutdown) = crate::shutdown::channel();
        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));

        let counter = dropped.clone();
        let handle = spawn_forwarder(hook_rx, tx, shutdown, move |n| {
            counter.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
        });

        let now = Utc::now();
        for i in 0..5 {
            hook_tx.send(InputEvent::key(i, now)).unwrap();
        }
        drop(hook_tx);
        handle.await.unwrap();
        trigger.trigger();

        assert_eq!(rx.recv().await, Some(InputEvent::key(0, now)));
        assert_eq!(rx.recv().await, Some(InputEvent::key(1, now)));
        assert_eq!(dropped.load(std::sync::atomic::Ordering::Relaxed), 3);
    }
}
