//! Reconnect backoff

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Exponential backoff: 1 s, 2 s, 4 s ... capped at 60 s, no attempt limit.
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
            attempt: 0,
        }
    }

    /// Wait before the next reconnection attempt.
    pub async fn wait(&mut self) {
        self.attempt += 1;
        debug!(
            attempt = self.attempt,
            delay_ms = self.current.as_millis() as u64,
            "waiting before reconnect"
        );
        sleep(self.current).await;
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = next.min(self.max);
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }
}
