//! Minimum-interval request gate.
//!
//! Every remote call attempt passes [`RateGate::wait`] first. Callers reserve
//! start slots `60s / rpm` apart under a fair (FIFO) async mutex, then sleep
//! until their slot outside the lock, so waiting callers never block each
//! other's reservations.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// FIFO gate spacing call starts at least `interval` apart.
#[derive(Debug)]
pub struct RateGate {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateGate {
    /// Gate for a requests-per-minute ceiling. `0` disables the gate.
    #[must_use]
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let interval = if requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60) / requests_per_minute
        };
        Self::with_interval(interval)
    }

    /// Gate with an explicit minimum interval.
    #[must_use]
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Minimum spacing between starts.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next start slot.
    pub async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}
