//! Worker Circuit Breaker
//!
//! Decides what happens to a session worker after a failed interaction.
//!
//! ```text
//! failure ──► failures < threshold ──► Recycle (reset session state, back to Ready)
//!        └──► failures ≥ threshold ──► Destroy (replacement created lazily)
//! ```

use std::time::Duration;

/// Default consecutive failures before a worker is destroyed
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;

/// Default inactivity window for one interaction
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Circuit-breaking policy for a worker pool
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures at which the worker is destroyed
    pub failure_threshold: u32,
    /// Inactivity window before an interaction is declared stalled
    pub stall_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

impl BreakerConfig {
    /// Outcome for a worker whose credential has `failures` consecutive failures
    #[must_use]
    pub fn verdict(&self, failures: u32) -> Verdict {
        if failures >= self.failure_threshold {
            Verdict::Destroy
        } else {
            Verdict::Recycle
        }
    }
}

/// What to do with a worker after a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Reset transient session state and return to `Ready`
    Recycle,
    /// Evict the worker permanently
    Destroy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_inclusive() {
        let breaker = BreakerConfig::default();
        assert_eq!(breaker.verdict(0), Verdict::Recycle);
        assert_eq!(breaker.verdict(9), Verdict::Recycle);
        assert_eq!(breaker.verdict(10), Verdict::Destroy);
        assert_eq!(breaker.verdict(11), Verdict::Destroy);
    }

    #[test]
    fn test_custom_threshold() {
        let breaker = BreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        assert_eq!(breaker.verdict(1), Verdict::Destroy);
    }
}
