//! Per-key log rate limiting.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Allows one log line per key per window.
#[derive(Debug)]
pub struct LogLimiter {
    window: Duration,
    last: HashMap<String, Instant>,
}

impl LogLimiter {
    /// Limiter with the given window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// Whether a line for `key` may be logged now. Records the attempt
    /// when it returns `true`.
    pub fn should_log(&mut self, key: &str) -> bool {
        self.should_log_at(key, Instant::now())
    }

    /// [`should_log`](Self::should_log) at an explicit instant.
    pub fn should_log_at(&mut self, key: &str, now: Instant) -> bool {
        match self.last.get(key) {
            Some(previous) if now.saturating_duration_since(*previous) < self.window => false,
            _ => {
                self.last.insert(key.to_owned(), now);
                true
            }
        }
    }

    /// Forget `key`.
    pub fn forget(&mut self, key: &str) {
        self.last.remove(key);
    }
}
