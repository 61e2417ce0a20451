//! macOS implementation of event collection using CGEvent tap.
//!
//! This module observes pointer movement and key presses at the session level
//! using Core Graphics. It requires Input Monitoring permission.

use crate::clock::SharedClock;
use crate::collector::types::InputEvent;
use crate::collector::{CollectorConfig, CollectorError, EVENT_CHANNEL_CAPACITY};
use core_foundation::runloop::{kCFRunLoopCommonModes, CFRunLoop};
use core_graphics::event::{
    CGEvent, CGEventTap, CGEventTapLocation, CGEventTapOptions, CGEventTapPlacement, CGEventType,
    CallbackResult, EventField,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// The macOS event collector using CGEvent tap.
pub struct MacOSCollector {
    config: CollectorConfig,
    sender: Sender<InputEvent>,
    receiver: Receiver<InputEvent>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    clock: SharedClock,
}

impl MacOSCollector {
    /// Create a new macOS collector with the given configuration.
    pub fn new(config: CollectorConfig, clock: SharedClock) -> Self {
        let (sender, receiver) = bounded(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            sender,
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            clock,
        }
    }

    /// Start capturing events in a background thread.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }
        if !check_permission() {
            return Err(CollectorError::PermissionDenied);
        }

        self.running.store(true, Ordering::SeqCst);

        let sender = self.sender.clone();
        let running = self.running.clone();
        let config = self.config.clone();
        let clock = self.clock.clone();

        let handle = thread::Builder::new()
            .name("input-tap".into())
            .spawn(move || {
                if let Err(e) = run_event_loop(sender, running.clone(), config, clock) {
                    tracing::error!(error = %e, "event tap loop failed");
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|_| CollectorError::TapCreationFailed)?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop capturing events.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    /// Check if the collector is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the receiver for input events.
    pub fn receiver(&self) -> &Receiver<InputEvent> {
        &self.receiver
    }

    /// Sender for feeding synthetic events in alongside the tap.
    pub fn injector(&self) -> Sender<InputEvent> {
        self.sender.clone()
    }
}

impl Drop for MacOSCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_event_types(config: &CollectorConfig) -> Vec<CGEventType> {
    let mut types = Vec::new();

    if config.capture_keyboard {
        types.push(CGEventType::KeyDown);
    }

    if config.capture_mouse {
        types.push(CGEventType::MouseMoved);
        types.push(CGEventType::LeftMouseDragged);
        types.push(CGEventType::RightMouseDragged);
    }

    types
}

fn run_event_loop(
    sender: Sender<InputEvent>,
    running: Arc<AtomicBool>,
    config: CollectorConfig,
    clock: SharedClock,
) -> Result<(), CollectorError> {
    let event_types = build_event_types(&config);

    let tap = CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::ListenOnly,
        event_types,
        move |_proxy, event_type, event| {
            if let Some(input) = convert_cg_event(event_type, event, &clock) {
                // Never block the tap; a full channel drops the event.
                let _ = sender.try_send(input);
            }
            CallbackResult::Keep
        },
    )
    .map_err(|_| CollectorError::TapCreationFailed)?;

    let source = tap
        .mach_port()
        .create_runloop_source(0)
        .map_err(|_| CollectorError::RunLoopSourceFailed)?;

    let run_loop = CFRunLoop::get_current();
    unsafe {
        run_loop.add_source(&source, kCFRunLoopCommonModes);
    }

    tap.enable();

    while running.load(Ordering::SeqCst) {
        CFRunLoop::run_in_mode(
            unsafe { kCFRunLoopCommonModes },
            std::time::Duration::from_millis(100),
            false,
        );
    }

    Ok(())
}

fn convert_cg_event(event_type: CGEventType, event: &CGEvent, clock: &SharedClock) -> Option<InputEvent> {
    use core_graphics::event::CGEventType::*;

    let timestamp = clock.now_utc();
    match event_type {
        KeyDown => {
            let key_id = event.get_integer_value_field(EventField::KEYBOARD_EVENT_KEYCODE);
            Some(InputEvent::key(key_id as u32, timestamp))
        }
        MouseMoved | LeftMouseDragged | RightMouseDragged => {
            let location = event.location();
            Some(InputEvent::pointer(location.x, location.y, timestamp))
        }
        _ => None,
    }
}

/// Check if the application has Input Monitoring permission.
///
/// macOS offers no direct query; creating a passive tap fails without it.
pub fn check_permission() -> bool {
    CGEventTap::new(
        CGEventTapLocation::Session,
        CGEventTapPlacement::HeadInsertEventTap,
        CGEventTapOptions::ListenOnly,
        vec![CGEventType::KeyDown],
        |_proxy, _type, _event| CallbackResult::Keep,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[test]
    fn test_event_types_follow_config() {
        let keyboard_only = CollectorConfig {
            capture_keyboard: true,
            capture_mouse: false,
        };
        assert_eq!(build_event_types(&keyboard_only).len(), 1);
        assert_eq!(build_event_types(&CollectorConfig::default()).len(), 4);
    }

    #[test]
    fn test_collector_creation() {
        let collector = MacOSCollector::new(CollectorConfig::default(), Arc::new(Clock::system()));
        assert!(!collector.is_running());
    }
}
