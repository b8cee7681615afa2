use std::time::Duration;

pub const DEFAULT_BASE: Duration = Duration::from_secs(5);
pub const DEFAULT_CAP: Duration = Duration::from_secs(60);

/// Reconnect delay that doubles per failed attempt up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            failures: 0,
        }
    }

    /// Delay before the next attempt. An attempt that reached Connected
    /// resets the sequence.
    pub fn next_delay(&mut self, reached_connected: bool) -> Duration {
        if reached_connected {
            self.failures = 0;
        }
        let factor = 2u32.saturating_pow(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}
