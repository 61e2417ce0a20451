//! Input event types delivered by the collectors.
//!
//! Events are immutable once produced and carry the timestamp assigned by
//! the agent clock at the moment the OS delivered them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pointer movement to an absolute screen position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerMove {
    /// Horizontal position in screen points
    pub x: f64,
    /// Vertical position in screen points
    pub y: f64,
    /// When the movement was observed
    pub timestamp: DateTime<Utc>,
}

impl PointerMove {
    pub fn new(x: f64, y: f64, timestamp: DateTime<Utc>) -> Self {
        Self { x, y, timestamp }
    }

    /// Euclidean distance to another position.
    pub fn distance_to(&self, other: &PointerMove) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// A key press. Only the virtual key code is kept, never the produced text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPress {
    /// Platform virtual key code
    pub key_id: u32,
    /// When the press was observed
    pub timestamp: DateTime<Utc>,
}

impl KeyPress {
    pub fn new(key_id: u32, timestamp: DateTime<Utc>) -> Self {
        Self { key_id, timestamp }
    }
}

/// Unified event type for the collectors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    PointerMove(PointerMove),
    KeyPress(KeyPress),
}

impl InputEvent {
    pub fn pointer(x: f64, y: f64, timestamp: DateTime<Utc>) -> Self {
        InputEvent::PointerMove(PointerMove::new(x, y, timestamp))
    }

    pub fn key(key_id: u32, timestamp: DateTime<Utc>) -> Self {
        InputEvent::KeyPress(KeyPress::new(key_id, timestamp))
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            InputEvent::PointerMove(e) => e.timestamp,
            InputEvent::KeyPress(e) => e.timestamp,
        }
    }
}
