//! Reconnection policy.
//!
//! Clients retry a failed connect a bounded number of times, waiting either a
//! fixed delay or an exponentially growing one between attempts.

use std::time::Duration;

/// Default delay between attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Default number of attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// How the delay evolves between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed,
    /// Delay doubles after each failure, up to `max_delay`.
    Exponential { max_delay: Duration },
}

/// Bounded reconnection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub delay: Duration,
    /// Total connect attempts, the first one included.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Fixed delay, bounded attempts.
    #[must_use]
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            backoff: Backoff::Fixed,
        }
    }

    /// Doubling delay capped at `max_delay`, bounded attempts.
    #[must_use]
    pub fn exponential(delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            backoff: Backoff::Exponential { max_delay },
        }
    }

    /// Whether the policy allows more than one attempt.
    #[must_use]
    pub fn retries(&self) -> bool {
        self.max_attempts > 1
    }

    /// Delay to wait after `failures` failed attempts, or `None` once the
    /// attempt budget is spent.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures == 0 || failures >= self.max_attempts {
            return None;
        }

        match self.backoff {
            Backoff::Fixed => Some(self.delay),
            Backoff::Exponential { max_delay } => {
                let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
                Some(self.delay.saturating_mul(factor).min(max_delay))
            }
        }
    }
}
