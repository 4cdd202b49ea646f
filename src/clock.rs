//! Wall-clock timestamps
//!
//! Timestamps are Unix milliseconds. Attempt history needs them to be
//! non-decreasing per traffic class even if the system clock steps back,
//! so recorders go through [`MonotonicStamp`].

use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Hands out wall-clock stamps that never go backwards
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicStamp {
    last: u64,
}

impl MonotonicStamp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time, clamped to the previous stamp
    pub fn next(&mut self) -> u64 {
        self.observe(now_ms())
    }

    /// Clamp an externally supplied timestamp
    pub fn observe(&mut self, ts: u64) -> u64 {
        self.last = self.last.max(ts);
        self.last
    }
}
