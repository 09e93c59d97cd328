//! Fleet-wide connection rate limiting.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum spacing between connection attempts across all nodes.
///
/// Waiters queue on the lock, so concurrent callers are released one
/// `spacing` apart in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    spacing: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_slot: Mutex::new(None),
        }
    }

    /// No spacing at all.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Wait for the next free slot.
    pub async fn acquire(&self) {
        if self.spacing.is_zero() {
            return;
        }
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = match *next_slot {
            Some(at) if at > now => {
                tokio::time::sleep_until(at).await;
                at
            }
            _ => now,
        };
        *next_slot = Some(slot + self.spacing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn spaces_consecutive_attempts() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        // First slot is immediate, the next three are 20ms apart.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
