//! Windows implementation of event collection using low-level hooks.
//!
//! `WH_KEYBOARD_LL` and `WH_MOUSE_LL` hooks observe key presses and pointer
//! positions system-wide. Only the virtual key code is forwarded.

use crate::clock::SharedClock;
use crate::collector::types::InputEvent;
use crate::collector::{CollectorConfig, CollectorError, EVENT_CHANNEL_CAPACITY};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, GetMessageW, PostThreadMessageW, SetWindowsHookExW, UnhookWindowsHookEx,
    HHOOK, KBDLLHOOKSTRUCT, MSG, MSLLHOOKSTRUCT, WH_KEYBOARD_LL, WH_MOUSE_LL, WM_KEYDOWN,
    WM_MOUSEMOVE, WM_QUIT, WM_SYSKEYDOWN,
};

/// The Windows event collector using low-level hooks.
pub struct WindowsCollector {
    config: CollectorConfig,
    sender: Sender<InputEvent>,
    receiver: Receiver<InputEvent>,
    running: Arc<AtomicBool>,
    hook_thread_id: Arc<AtomicU32>,
    thread_handle: Option<JoinHandle<()>>,
    clock: SharedClock,
}

impl WindowsCollector {
    /// Create a new Windows collector with the given configuration.
    pub fn new(config: CollectorConfig, clock: SharedClock) -> Self {
        let (sender, receiver) = bounded(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            sender,
            receiver,
            running: Arc::new(AtomicBool::new(false)),
            hook_thread_id: Arc::new(AtomicU32::new(0)),
            thread_handle: None,
            clock,
        }
    }

    /// Start capturing events in a background thread.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(CollectorError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);

        let state = HookState {
            sender: self.sender.clone(),
            clock: self.clock.clone(),
        };
        let running = self.running.clone();
        let thread_id = self.hook_thread_id.clone();
        let config = self.config.clone();

        let handle = thread::Builder::new()
            .name("input-hook".into())
            .spawn(move || {
                thread_id.store(unsafe { GetCurrentThreadId() }, Ordering::SeqCst);
                if let Err(e) = run_hook_loop(state, running.clone(), config) {
                    tracing::error!(error = %e, "input hook loop failed");
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|_| CollectorError::HookInstallationFailed)?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop capturing events.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // GetMessageW blocks until a message arrives; wake it with WM_QUIT.
        let thread_id = self.hook_thread_id.load(Ordering::SeqCst);
        if thread_id != 0 {
            let _ = unsafe { PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0)) };
        }
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

    /// Sender for feeding synthetic events in alongside the hooks.
    pub fn injector(&self) -> Sender<InputEvent> {
        self.sender.clone()
    }
}

impl Drop for WindowsCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

struct HookState {
    sender: Sender<InputEvent>,
    clock: SharedClock,
}

// Hook procedures are plain functions, so their state lives with the hook thread.
thread_local! {
    static HOOK_STATE: RefCell<Option<HookState>> = const { RefCell::new(None) };
}

fn emit(build: impl FnOnce(DateTime<Utc>) -> Option<InputEvent>) {
    HOOK_STATE.with(|state| {
        if let Some(state) = state.borrow().as_ref() {
            if let Some(event) = build(state.clock.now_utc()) {
                // Never block the hook; a full channel drops the event.
                let _ = state.sender.try_send(event);
            }
        }
    });
}

fn convert_key_message(message: u32, vk_code: u32, timestamp: DateTime<Utc>) -> Option<InputEvent> {
    match message {
        WM_KEYDOWN | WM_SYSKEYDOWN => Some(InputEvent::key(vk_code, timestamp)),
        _ => None,
    }
}

fn convert_mouse_message(message: u32, x: i32, y: i32, timestamp: DateTime<Utc>) -> Option<InputEvent> {
    match message {
        WM_MOUSEMOVE => Some(InputEvent::pointer(f64::from(x), f64::from(y), timestamp)),
        _ => None,
    }
}

unsafe extern "system" fn keyboard_hook_proc(
    n_code: i32,
    w_param: WPARAM,
    l_param: LPARAM,
) -> LRESULT {
    if n_code >= 0 {
        let kb = &*(l_param.0 as *const KBDLLHOOKSTRUCT);
        let message = w_param.0 as u32;
        emit(|ts| convert_key_message(message, kb.vkCode, ts));
    }
    CallNextHookEx(HHOOK::default(), n_code, w_param, l_param)
}

unsafe extern "system" fn mouse_hook_proc(
    n_code: i32,
    w_param: WPARAM,
    l_param: LPARAM,
) -> LRESULT {
    if n_code >= 0 {
        let mouse = &*(l_param.0 as *const MSLLHOOKSTRUCT);
        let message = w_param.0 as u32;
        emit(|ts| convert_mouse_message(message, mouse.pt.x, mouse.pt.y, ts));
    }
    CallNextHookEx(HHOOK::default(), n_code, w_param, l_param)
}

fn run_hook_loop(
    state: HookState,
    running: Arc<AtomicBool>,
    config: CollectorConfig,
) -> Result<(), CollectorError> {
    HOOK_STATE.with(|s| *s.borrow_mut() = Some(state));

    let mut hooks: Vec<HHOOK> = Vec::new();
    let result = unsafe { install_hooks(&config, &mut hooks) };

    if result.is_ok() {
        let mut msg = MSG::default();
        while running.load(Ordering::SeqCst) {
            // Hooks run inside GetMessageW; 0 is WM_QUIT, -1 is an error.
            let got = unsafe { GetMessageW(&mut msg, HWND::default(), 0, 0) };
            if got.0 <= 0 {
                break;
            }
        }
    }

    for hook in hooks {
        let _ = unsafe { UnhookWindowsHookEx(hook) };
    }
    HOOK_STATE.with(|s| *s.borrow_mut() = None);

    result
}

unsafe fn install_hooks(config: &CollectorConfig, hooks: &mut Vec<HHOOK>) -> Result<(), CollectorError> {
    if config.capture_keyboard {
        let hook = SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_hook_proc), None, 0)
            .map_err(|_| CollectorError::HookInstallationFailed)?;
        hooks.push(hook);
    }
    if config.capture_mouse {
        let hook = SetWindowsHookExW(WH_MOUSE_LL, Some(mouse_hook_proc), None, 0)
            .map_err(|_| CollectorError::HookInstallationFailed)?;
        hooks.push(hook);
    }
    Ok(())
}

/// Check whether a low-level hook can be installed.
///
/// Windows has no permission prompt for hooks, but a restricted session can
/// still refuse them, so a temporary hook is installed and removed.
pub fn check_permission() -> bool {
    unsafe {
        match SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_hook_proc), None, 0) {
            Ok(hook) => {
                let _ = UnhookWindowsHookEx(hook);
                true
            }
            Err(_) => false,
        }
    }
}
