use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often stale source keys are purged from the map.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Sliding-window admission limiter keyed by source address.
///
/// Each key maps to its recent admission timestamps, kept in insertion
/// order (monotonic), so the in-window suffix is found with a binary
/// search. Safe to call from any task.
pub struct RateLimiter {
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    /// Decides whether to admit a connection from `key` right now.
    ///
    /// Exceeding the limit is a normal outcome, not an error; a refused
    /// attempt is not recorded against the window.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().unwrap();
        let recent = attempts.entry(key.to_string()).or_default();

        // Drop everything at or before the window cutoff.
        if let Some(cutoff) = now.checked_sub(self.window) {
            let stale = recent.partition_point(|t| *t <= cutoff);
            recent.drain(..stale);
        }

        if recent.len() >= self.limit {
            return false;
        }
        recent.push(now);
        true
    }

    /// Periodically deletes keys whose attempts have all left the window,
    /// bounding memory under source-address churn. Runs until cancelled.
    pub async fn run_cleanup(&self, cancel: CancellationToken) {
        let mut ticker = interval(CLEANUP_INTERVAL);
        ticker.tick().await; // The first tick fires immediately.

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.cleanup(),
            }
        }
    }

    fn cleanup(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.window) else {
            return;
        };
        let mut attempts = self.attempts.lock().unwrap();
        let before = attempts.len();
        attempts.retain(|_, times| {
            times.retain(|t| *t > cutoff);
            !times.is_empty()
        });
        let removed = before - attempts.len();
        if removed > 0 {
            debug!(removed, "rate limiter dropped idle source keys");
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}
