use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Fixed-window request counter: the window key is the wall-clock minute,
/// the count resets whenever the key changes.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limit_per_window: u32,
    window_seconds: u64,
    state: Mutex<WindowState>,
}

#[derive(Debug, Default)]
struct WindowState {
    window_key: i64,
    count: u32,
}

impl FixedWindowLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, 60)
    }

    pub fn new(limit_per_window: u32, window_seconds: u64) -> Self {
        Self {
            limit_per_window: limit_per_window.max(1),
            window_seconds: window_seconds.max(1),
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn allow(&self, now: DateTime<Utc>) -> bool {
        let key = now.timestamp() / self.window_seconds as i64;
        let mut state = self.state.lock().expect("rate limiter lock poisoned");
        if state.window_key != key {
            state.window_key = key;
            state.count = 0;
        }
        if state.count >= self.limit_per_window {
            return false;
        }
        state.count += 1;
        true
    }
}
