//! Scheduler module for orchestrating background inspections.
//!
//! The scheduler is responsible for:
//! - Enumerating domains on every tick and reconciling the tracked set
//! - Dispatching inspections to a bounded pool of workers
//! - Keeping at most one dispatch in flight per domain
//! - Retrying failures with exponential backoff (busy images on a short fixed timer)
//! - Evicting domains that disappear from enumeration
//! - Cancelling workers and releasing sandboxes on shutdown
//!
//! # Domain states
//!
//! `Pending -> InFlight -> Fresh | Backoff`, with `Fresh -> Pending` once the
//! freshness window elapses and `Backoff -> Pending` once the retry time
//! passes. Domains without disks are tracked as `Diskless` and never
//! dispatched.

mod backoff;
mod service;
mod state;

pub use backoff::{DEFAULT_BASE_BACKOFF, DEFAULT_BUSY_RETRY, DEFAULT_MAX_BACKOFF, RetryPolicy};
pub use service::{InspectionScheduler, SchedulerConfig};
pub use state::{DomainState, InFlight, TrackedDomain};
