//! Reconnection strategies
//!
//! When the socket closes unexpectedly the connection asks its strategy how
//! long to wait before the next attempt, or whether to give up.
//!
//! The built-in `ExponentialBackoff` uses the randomized formula
//!
//! ```text
//! delay = min(max, (random() + 1) * initial * 2^attempt)
//! ```
//!
//! so that a fleet of clients losing the same server does not come back in
//! lockstep.
//!
//! # Examples
//!
//! ```rust
//! use tiip_client::{ExponentialBackoff, ReconnectionStrategy};
//! use std::time::Duration;
//!
//! // Default: 300ms doubling up to 2 minutes, never gives up
//! let default = ExponentialBackoff::default();
//!
//! // Deterministic and bounded
//! let mut strategy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5))
//!     .without_jitter()
//!     .with_max_attempts(3);
//! assert_eq!(strategy.next_delay(1), Some(Duration::from_millis(200)));
//! assert_eq!(strategy.next_delay(4), None);
//! ```

use rand::Rng;
use std::time::Duration;

/// Trait for reconnection strategies
///
/// `attempt` starts at 1 for the first reconnect after a drop and grows by
/// one per cycle until a connection opens, at which point the connection
/// calls `reset()` and counting starts again.
pub trait ReconnectionStrategy: Send + Sync {
    /// Delay before reconnect attempt number `attempt`, or `None` to give up
    fn next_delay(&mut self, attempt: u32) -> Option<Duration>;

    /// Called after a successful open
    fn reset(&mut self);
}

/// Randomized exponential backoff
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    jitter: bool,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a strategy growing from `initial` and capped at `max`
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            max_attempts: None,
            jitter: true,
            current_attempt: 0,
        }
    }

    /// Give up after this many attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Use a factor of exactly 1 instead of a random one in `[1, 2)`
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Lower bound of the delay for `attempt`, before the cap is applied
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(63) as i32);
        Duration::from_secs_f64((self.initial.as_secs_f64() * factor).min(self.max.as_secs_f64()))
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(300), Duration::from_secs(120))
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        self.current_attempt = attempt;

        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }

        let random: f64 = if self.jitter {
            rand::thread_rng().gen_range(0.0..1.0)
        } else {
            0.0
        };

        let exponential =
            (random + 1.0) * self.initial.as_secs_f64() * 2f64.powi(attempt.min(63) as i32);
        let capped = exponential.min(self.max.as_secs_f64());

        Some(Duration::from_secs_f64(capped))
    }

    fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
