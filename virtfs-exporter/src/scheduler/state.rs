//! Per-domain scheduling state owned by the scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{DomainRef, FailureReason, InspectionResult, InspectionStatus};
use crate::utils::time::deadline_after;

use super::backoff::RetryPolicy;

/// Scheduling state of one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    /// Eligible for inspection.
    Pending,
    /// A worker is inspecting the domain.
    InFlight,
    /// Latest result is a success within the freshness window.
    Fresh,
    /// Waiting for a retry after a failure.
    Backoff,
    /// No persistent disk attached. Never inspected.
    Diskless,
}

impl DomainState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Fresh => "fresh",
            Self::Backoff => "backoff",
            Self::Diskless => "diskless",
        }
    }
}

/// Marker for the single outstanding dispatch of a domain.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub generation: u64,
    pub cancel: CancellationToken,
}

/// Scheduler bookkeeping for one domain.
#[derive(Debug, Clone)]
pub struct TrackedDomain {
    pub domain: DomainRef,
    pub in_flight: Option<InFlight>,
    /// Monotonic time of the last dispatch, used for ordering.
    pub last_attempt: Option<Instant>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Monotonic time of the last success, used for freshness.
    pub last_success: Option<Instant>,
    /// Most recent successful result.
    pub last_result: Option<Arc<InspectionResult>>,
    pub consecutive_failures: u32,
    pub last_error: Option<FailureReason>,
    /// Earliest time of the next attempt after a failure.
    pub retry_at: Option<Instant>,
}

impl TrackedDomain {
    pub fn new(domain: DomainRef) -> Self {
        Self {
            domain,
            in_flight: None,
            last_attempt: None,
            last_attempt_at: None,
            last_success: None,
            last_result: None,
            consecutive_failures: 0,
            last_error: None,
            retry_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.domain.domain_id
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    fn is_fresh(&self, now: Instant, freshness: Duration) -> bool {
        self.last_success
            .is_some_and(|t| now.saturating_duration_since(t) <= freshness)
    }

    /// First instant at which the last success stops counting as fresh.
    ///
    /// `None` when the state is governed by something else: a dispatch in
    /// flight, a pending retry, no disks, or no success yet.
    pub fn fresh_until(&self, freshness: Duration) -> Option<Instant> {
        if self.is_in_flight() || self.retry_at.is_some() || !self.domain.has_disks() {
            return None;
        }
        self.last_success
            .map(|t| deadline_after(t, freshness) + Duration::from_millis(1))
    }

    /// Current state as of `now`.
    pub fn state(&self, now: Instant, freshness: Duration) -> DomainState {
        if self.is_in_flight() {
            return DomainState::InFlight;
        }
        if !self.domain.has_disks() {
            return DomainState::Diskless;
        }
        if let Some(retry_at) = self.retry_at {
            return if now < retry_at {
                DomainState::Backoff
            } else {
                DomainState::Pending
            };
        }
        if self.is_fresh(now, freshness) {
            DomainState::Fresh
        } else {
            DomainState::Pending
        }
    }

    pub fn is_eligible(&self, now: Instant, freshness: Duration) -> bool {
        self.state(now, freshness) == DomainState::Pending
    }

    /// A success exists but the domain is overdue or failing.
    pub fn is_stale(&self, now: Instant, freshness: Duration) -> bool {
        self.last_result.is_some() && (self.last_error.is_some() || !self.is_fresh(now, freshness))
    }

    /// Mark a new dispatch.
    pub fn begin(&mut self, generation: u64, cancel: CancellationToken, now: Instant) {
        self.in_flight = Some(InFlight { generation, cancel });
        self.last_attempt = Some(now);
        self.last_attempt_at = Some(Utc::now());
    }

    /// Apply a completion for `generation`.
    ///
    /// Returns `false` and changes nothing if the completion is not for the
    /// current dispatch.
    pub fn complete(
        &mut self,
        generation: u64,
        result: InspectionResult,
        policy: &RetryPolicy,
        now: Instant,
    ) -> bool {
        match &self.in_flight {
            Some(f) if f.generation == generation => {}
            _ => return false,
        }
        self.in_flight = None;

        match result.status {
            InspectionStatus::Success => {
                self.consecutive_failures = 0;
                self.last_error = None;
                self.retry_at = None;
                self.last_success = Some(now);
                self.last_result = Some(Arc::new(result));
            }
            InspectionStatus::Failed(FailureReason::Cancelled) => {}
            InspectionStatus::Failed(reason) => {
                if reason.is_durable() {
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                }
                self.retry_at = policy
                    .retry_delay(&reason, self.consecutive_failures)
                    .map(|delay| deadline_after(now, delay));
                self.last_error = Some(reason);
            }
        }
        true
    }

    /// Cancel any outstanding dispatch. Its completion will be discarded.
    pub fn abandon(&mut self) {
        if let Some(f) = self.in_flight.take() {
            f.cancel.cancel();
        }
    }

    /// Ordering key for dispatch: never attempted first, then oldest attempt.
    pub fn dispatch_key(&self) -> (Option<Instant>, &str) {
        (self.last_attempt, self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DiskSource;

    const FRESH: Duration = Duration::from_secs(3600);

    fn tracked() -> TrackedDomain {
        TrackedDomain::new(DomainRef::new("vm1", "vm1").with_disk(DiskSource::new("/d1")))
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(100),
            busy_retry: Duration::from_secs(3),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_domain_is_pending() {
        let t = tracked();
        assert_eq!(t.state(Instant::now(), FRESH), DomainState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn diskless_domain_is_never_eligible() {
        let t = TrackedDomain::new(DomainRef::new("vm0", "vm0"));
        assert_eq!(t.state(Instant::now(), FRESH), DomainState::Diskless);
        assert!(!t.is_eligible(Instant::now(), FRESH));
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_fresh_until_window_passes() {
        let mut t = tracked();
        let now = Instant::now();
        t.begin(1, CancellationToken::new(), now);
        assert_eq!(t.state(now, FRESH), DomainState::InFlight);
        assert!(t.complete(1, InspectionResult::success("vm1", vec![]), &policy(), now));
        assert_eq!(t.state(now, FRESH), DomainState::Fresh);
        assert_eq!(t.state(now + FRESH + Duration::from_secs(1), FRESH), DomainState::Pending);
        assert!(t.is_stale(now + FRESH + Duration::from_secs(1), FRESH));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_discarded() {
        let mut t = tracked();
        let now = Instant::now();
        t.begin(7, CancellationToken::new(), now);
        assert!(!t.complete(6, InspectionResult::failed("vm1", FailureReason::Timeout), &policy(), now));
        assert!(t.is_in_flight());
        assert_eq!(t.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn durable_failure_backs_off_and_keeps_result() {
        let mut t = tracked();
        let now = Instant::now();
        t.begin(1, CancellationToken::new(), now);
        t.complete(1, InspectionResult::success("vm1", vec![]), &policy(), now);
        let good = t.last_result.clone();

        t.begin(2, CancellationToken::new(), now);
        t.complete(2, InspectionResult::failed("vm1", FailureReason::Timeout), &policy(), now);
        assert_eq!(t.consecutive_failures, 1);
        assert_eq!(t.retry_at, Some(now + Duration::from_secs(10)));
        assert_eq!(t.state(now, FRESH), DomainState::Backoff);
        assert_eq!(t.last_result, good);
        assert!(t.is_stale(now, FRESH));
        assert_eq!(t.state(now + Duration::from_secs(10), FRESH), DomainState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_does_not_extend_streak() {
        let mut t = tracked();
        let now = Instant::now();
        t.consecutive_failures = 4;
        t.begin(1, CancellationToken::new(), now);
        t.complete(1, InspectionResult::failed("vm1", FailureReason::Busy), &policy(), now);
        assert_eq!(t.consecutive_failures, 4);
        assert_eq!(t.retry_at, Some(now + Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_retry_delay_is_clamped() {
        let mut t = tracked();
        let now = Instant::now();
        let policy = RetryPolicy {
            busy_retry: Duration::MAX,
            ..policy()
        };
        t.begin(1, CancellationToken::new(), now);
        t.complete(1, InspectionResult::failed("vm1", FailureReason::Busy), &policy, now);
        assert_eq!(t.retry_at, Some(now + crate::utils::time::MAX_DELAY));
        assert_eq!(t.state(now, FRESH), DomainState::Backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_until_marks_first_stale_instant() {
        let mut t = tracked();
        let now = Instant::now();
        assert_eq!(t.fresh_until(FRESH), None);

        t.begin(1, CancellationToken::new(), now);
        assert_eq!(t.fresh_until(FRESH), None);
        t.complete(1, InspectionResult::success("vm1", vec![]), &policy(), now);

        let until = t.fresh_until(FRESH).unwrap();
        assert!(!t.is_stale(until - Duration::from_millis(1), FRESH));
        assert!(t.is_stale(until, FRESH));
        assert_eq!(t.state(until, FRESH), DomainState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_cancels_token() {
        let mut t = tracked();
        let token = CancellationToken::new();
        t.begin(1, token.clone(), Instant::now());
        t.abandon();
        assert!(token.is_cancelled());
        assert!(!t.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn never_attempted_sorts_first() {
        let mut a = tracked();
        a.begin(1, CancellationToken::new(), Instant::now());
        a.in_flight = None;
        let b = TrackedDomain::new(DomainRef::new("vm2", "vm2").with_disk(DiskSource::new("/d2")));
        assert!(b.dispatch_key() < a.dispatch_key());
    }
}
