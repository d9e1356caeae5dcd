//! Retry delays for failed inspections.
//!
//! # Backoff Algorithm
//!
//! - Durable failures (timeout, unreadable image, sandbox failure):
//!   `backoff = base * 2^(failures - 1)`, capped at `max_backoff`
//! - Busy images retry after a fixed short interval regardless of streak
//! - Cancelled inspections are not retried on a timer

use std::time::Duration;

use crate::config::ExporterConfig;
use crate::domain::FailureReason;

/// Default base backoff duration (1 minute).
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(60);

/// Default maximum backoff duration (6 hours).
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(6 * 60 * 60);

/// Default retry interval for busy images (30 seconds).
pub const DEFAULT_BUSY_RETRY: Duration = Duration::from_secs(30);

/// Maximum exponent to prevent overflow.
const MAX_EXPONENT: u32 = 20;

/// Retry timing for failed inspections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first durable failure.
    pub base_backoff: Duration,
    /// Upper bound of the durable-failure delay.
    pub max_backoff: Duration,
    /// Fixed delay after a busy result.
    pub busy_retry: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            busy_retry: DEFAULT_BUSY_RETRY,
        }
    }
}

impl From<&ExporterConfig> for RetryPolicy {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            base_backoff: config.backoff_base(),
            max_backoff: config.backoff_max(),
            busy_retry: config.busy_retry(),
        }
    }
}

impl RetryPolicy {
    /// Backoff after `failures` consecutive durable failures.
    ///
    /// Formula: base * 2^(failures - 1) for failures >= 1
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = (failures - 1).min(MAX_EXPONENT);
        let multiplier = 2u32.saturating_pow(exponent);
        let backoff = self.base_backoff.saturating_mul(multiplier);

        // Cap at max backoff
        backoff.min(self.max_backoff)
    }

    /// Delay before the next attempt after `reason`.
    ///
    /// `failures` is the streak after the failure was recorded. Returns
    /// `None` when the failure does not schedule a timed retry.
    pub fn retry_delay(&self, reason: &FailureReason, failures: u32) -> Option<Duration> {
        match reason {
            FailureReason::Busy => Some(self.busy_retry),
            FailureReason::Cancelled => None,
            _ => Some(self.backoff(failures.max(1))),
        }
    }
}
