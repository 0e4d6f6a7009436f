//! Bounded, time-windowed log of recent chat lines.
//!
//! Holds everything the occupants can "see": real chat, synthetic chat, and
//! join/leave announcements. Snapshots of it become generation context.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;

/// Retained line cap; the oldest line is evicted first.
const MAX_RECENT_MESSAGES: usize = 12;

/// Lines older than this are dropped even when the buffer is not full.
const MESSAGE_EXPIRATION_MS: i64 = 15 * 60 * 1000;

struct ChatLine {
    timestamp_ms: i64,
    text: String,
}

pub struct ChatLog {
    cap: usize,
    window_ms: i64,
    lines: Mutex<VecDeque<ChatLine>>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::with_limits(MAX_RECENT_MESSAGES, MESSAGE_EXPIRATION_MS)
    }

    /// Custom cap/window, mainly for tests and tuning.
    pub fn with_limits(cap: usize, window_ms: i64) -> Self {
        Self {
            cap,
            window_ms,
            lines: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a rendered line, evicting expired and overflow entries.
    /// Never blocks beyond the internal lock and never fails.
    pub fn append(&self, text: impl Into<String>) {
        self.append_at(Utc::now().timestamp_millis(), text.into());
    }

    fn append_at(&self, now_ms: i64, text: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.push_back(ChatLine {
            timestamp_ms: now_ms,
            text,
        });
        while lines
            .front()
            .is_some_and(|line| now_ms - line.timestamp_ms > self.window_ms)
        {
            lines.pop_front();
        }
        while lines.len() > self.cap {
            lines.pop_front();
        }
    }

    /// Point-in-time copy of the retained lines, most recent last.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().map(|line| line.text.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new()
    }
}
