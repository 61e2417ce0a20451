//! Fallback (noop) implementation of event collection.
//!
//! Used where no system hook exists. Events can still be fed in through
//! [`NoopCollector::injector`] or [`NoopCollector::inject_key`], which is how
//! tests and headless runs drive the classifier.

use crate::clock::SharedClock;
use crate::collector::types::InputEvent;
use crate::collector::{CollectorConfig, CollectorError, EVENT_CHANNEL_CAPACITY};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A collector that never emits events on its own.
pub struct NoopCollector {
    config: CollectorConfig,
    sender: Sender<InputEvent>,
    receiver: Receiver<InputEvent>,
    running: Arc<AtomicBool>,
    clock: SharedClock,
}

impl NoopCollector {
    /// Create a new noop collector.
    pub fn new(config: CollectorConfig, clock: SharedClock) -> Self {
        let (sender, receiver) = bounded(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            sender,
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            clock,
        }
    }

    /// Start capturing events.
    ///
    /// Without a hook, this simply marks the collector as running.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);
        tracing::warn!(
            keyboard = self.config.capture_keyboard,
            mouse = self.config.capture_mouse,
            "no input hook on this platform; only injected events are observed"
        );
        Ok(())
    }

    /// Stop capturing events.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Check if the collector is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the receiver for input events.
    pub fn receiver(&self) -> &Receiver<InputEvent> {
        &self.receiver
    }

    /// Sender for feeding events in from outside.
    pub fn injector(&self) -> Sender<InputEvent> {
        self.sender.clone()
    }

    /// Feed a key press stamped with the agent clock. Returns false when
    /// the channel is full and the event was dropped.
    pub fn inject_key(&self, key_id: u32) -> bool {
        self.sender
            .try_send(InputEvent::key(key_id, self.clock.now_utc()))
            .is_ok()
    }

    /// Feed a pointer move stamped with the agent clock.
    pub fn inject_pointer(&self, x: f64, y: f64) -> bool {
        self.sender
            .try_send(InputEvent::pointer(x, y, self.clock.now_utc()))
            .is_ok()
    }
}

/// Without a hook there is no permission gate.
pub fn check_permission() -> bool {
    true
}
