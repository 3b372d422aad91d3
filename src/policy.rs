//! Retry and restart policies.
//!
//! [`RetryPolicy`] governs how the writer opens its output file: a fixed
//! number of attempts with a constant pause in between.
//!
//! [`RestartPolicy`] bounds how often the supervisor replaces a writer. The
//! first restart is immediate; after restart `n` (0-indexed) the next one
//! waits at least `first × factor^n`, clamped to `max`. Once `max_restarts`
//! replacements have been made the supervisor gives up.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use log2bin::policy::RestartPolicy;
//!
//! let policy = RestartPolicy {
//!     max_restarts: 5,
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(1),
//!     factor: 2.0,
//! };
//!
//! assert_eq!(policy.delay_for(0), Duration::from_millis(100));
//! assert_eq!(policy.delay_for(2), Duration::from_millis(400));
//! assert_eq!(policy.delay_for(10), Duration::from_secs(1));
//! ```

use crate::config::PipelineConfig;
use std::time::Duration;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl RetryPolicy {
    /// `max_open_retries` attempts, `retry_backoff` apart.
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_open_retries,
            backoff_delay: config.retry_backoff,
        }
    }
}

/// Bounded restart policy with exponential backoff.
#[derive(Clone, Copy, Debug)]
pub struct RestartPolicy {
    /// Replacement writers allowed per session.
    pub max_restarts: u32,
    /// Delay before the first restart.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0`).
    pub factor: f64,
}

impl RestartPolicy {
    /// Budget and backoff from the `restart_*` settings.
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            first: config.restart_backoff_first,
            max: config.restart_backoff_max,
            factor: config.restart_backoff_factor,
        }
    }

    /// Whether another restart is allowed after `restarts` have been made.
    pub fn allows(&self, restarts: u32) -> bool {
        restarts < self.max_restarts
    }

    /// Minimum spacing between restart `restarts` and the one after it.
    pub fn delay_for(&self, restarts: u32) -> Duration {
        let exp = restarts.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
