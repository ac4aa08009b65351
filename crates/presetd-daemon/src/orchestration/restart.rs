//! Sliding-window limiter for automatic restarts after a crash.

use std::time::Duration;

use tokio::time::Instant;

/// Maximum automatic restarts allowed inside [`AUTORESTART_WINDOW`].
pub const AUTORESTART_LIMIT: usize = 2;

/// Window over which restart attempts are counted.
pub const AUTORESTART_WINDOW: Duration = Duration::from_secs(60);

/// Tracks recent restart attempts for one preset.
///
/// Not synchronised; each preset owns its limiter and only the supervisor
/// loop touches it.
#[derive(Debug, Clone, Default)]
pub struct RestartLimiter {
    recent_restarts: Vec<Instant>,
}

impl RestartLimiter {
    pub const fn new() -> Self {
        Self {
            recent_restarts: Vec::new(),
        }
    }

    /// Record a restart attempt if the window still has room.
    ///
    /// Returns the 1-based attempt number inside the current window, or
    /// `None` when the limit is reached (nothing is recorded in that case).
    pub fn begin_attempt(&mut self) -> Option<usize> {
        let now = Instant::now();
        self.recent_restarts
            .retain(|t| now.duration_since(*t) <= AUTORESTART_WINDOW);
        if self.recent_restarts.len() >= AUTORESTART_LIMIT {
            return None;
        }
        self.recent_restarts.push(now);
        Some(self.recent_restarts.len())
    }

    /// Forget all recorded attempts.
    pub fn clear(&mut self) {
        self.recent_restarts.clear();
    }
}
