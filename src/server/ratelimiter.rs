use tokio::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Fixed one-minute window counter for one session's outbound chat lines.
pub struct RateLimiter {
    count: u32,
    window_start: Instant,
    max_per_minute: u32,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
            max_per_minute,
        }
    }

    /// Record one message; `false` if it goes over the limit for this window.
    pub fn check_limit(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= WINDOW {
            self.count = 0;
            self.window_start = now;
        }

        self.count = self.count.saturating_add(1);
        self.count <= self.max_per_minute
    }
}
