//! Deadline arithmetic on the tokio clock.

use std::time::Duration;

use tokio::time::Instant;

/// Longest delay any timer is armed for (ten years).
///
/// Configuration rejects larger values; this bound keeps deadline math
/// panic-free for delays computed at runtime.
pub const MAX_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// `from + delay`, with `delay` clamped to [`MAX_DELAY`].
pub fn deadline_after(from: Instant, delay: Duration) -> Instant {
    let delay = delay.min(MAX_DELAY);
    from.checked_add(delay).unwrap_or(from + MAX_DELAY)
}
