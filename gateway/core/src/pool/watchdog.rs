//! Inactivity Watchdog
//!
//! A per-interaction deadline that is pushed forward every time upstream
//! produces data. Decoders race `expired()` against their next chunk.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Resettable inactivity deadline
#[derive(Clone, Debug)]
pub struct InactivityWatchdog {
    timeout: Duration,
    deadline: Arc<Mutex<Instant>>,
}

impl InactivityWatchdog {
    /// Start a watchdog expiring `timeout` from now
    #[must_use]
    pub fn start(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Arc::new(Mutex::new(Instant::now() + timeout)),
        }
    }

    /// Inactivity window
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record activity, pushing the deadline forward
    pub fn touch(&self) {
        *self.deadline.lock() = Instant::now() + self.timeout;
    }

    /// Whether the deadline has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= *self.deadline.lock()
    }

    /// Resolve once the deadline passes without being pushed forward
    pub async fn expired(&self) {
        loop {
            let deadline = *self.deadline.lock();
            tokio::time::sleep_until(deadline).await;
            if Instant::now() >= *self.deadline.lock() {
                return;
            }
        }
    }
}
