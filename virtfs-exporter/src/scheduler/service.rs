//! Inspection scheduler service.
//!
//! One control loop owns every [`TrackedDomain`] and is the only writer of
//! the [`MetricsCache`]. Workers run on a bounded pool of slots and report
//! back over a channel; the loop applies each report to the domain it was
//! dispatched for, discarding reports from superseded dispatches.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::config::ExporterConfig;
use crate::domain::{FailureReason, InspectionResult};
use crate::hypervisor::{ConnectionStatus, DomainMetadataManager, Enumeration};
use crate::inspector::InspectionWorker;
use crate::metrics::{CacheEntry, ExporterStats, MetricsCache};
use crate::utils::time::deadline_after;

use super::backoff::RetryPolicy;
use super::state::{DomainState, TrackedDomain};

/// Extra time granted to workers on shutdown beyond the inspection timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between enumeration ticks.
    pub interval: Duration,
    /// Age after which a successful result is re-inspected.
    pub freshness_window: Duration,
    /// Number of concurrent worker slots.
    pub max_workers: usize,
    /// Hard bound on a single inspection.
    pub inspection_timeout: Duration,
    pub retry: RetryPolicy,
    /// No inspection is dispatched before this much time has passed.
    pub startup_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&ExporterConfig::default())
    }
}

impl From<&ExporterConfig> for SchedulerConfig {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            interval: config.interval(),
            freshness_window: config.freshness_window(),
            max_workers: config.workers,
            inspection_timeout: config.inspection_timeout(),
            retry: RetryPolicy::from(config),
            startup_delay: Duration::ZERO,
        }
    }
}

/// Report from a finished worker.
#[derive(Debug)]
struct Completion {
    domain_id: String,
    generation: u64,
    result: InspectionResult,
    duration: Duration,
}

/// Sends exactly one completion for a dispatch, even if the worker task
/// panics or is aborted before producing a result.
struct CompletionReporter {
    tx: mpsc::UnboundedSender<Completion>,
    domain_id: String,
    generation: u64,
    started: Instant,
    sent: bool,
}

impl CompletionReporter {
    fn send(mut self, result: InspectionResult) {
        self.sent = true;
        let _ = self.tx.send(Completion {
            domain_id: self.domain_id.clone(),
            generation: self.generation,
            result,
            duration: self.started.elapsed(),
        });
    }
}

impl Drop for CompletionReporter {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        let reason = FailureReason::Sandbox("inspection task aborted".to_string());
        let _ = self.tx.send(Completion {
            domain_id: self.domain_id.clone(),
            generation: self.generation,
            result: InspectionResult::failed(self.domain_id.as_str(), reason),
            duration: self.started.elapsed(),
        });
    }
}

fn outcome_label(result: &InspectionResult) -> &'static str {
    result.failure().map_or("success", FailureReason::as_str)
}

fn cache_entry(tracked: &TrackedDomain, now: Instant, freshness: Duration) -> CacheEntry {
    CacheEntry {
        domain: tracked.domain.clone(),
        state: tracked.state(now, freshness),
        last_result: tracked.last_result.clone(),
        last_attempt_at: tracked.last_attempt_at,
        consecutive_failures: tracked.consecutive_failures,
        last_error: tracked.last_error.clone(),
        in_flight: tracked.is_in_flight(),
        stale: tracked.is_stale(now, freshness),
    }
}

/// The inspection control loop.
pub struct InspectionScheduler {
    config: SchedulerConfig,
    metadata: DomainMetadataManager,
    worker: InspectionWorker,
    cache: Arc<MetricsCache>,
    stats: Arc<ExporterStats>,
    cancellation_token: CancellationToken,
    domains: HashMap<String, TrackedDomain>,
    slots: Arc<Semaphore>,
    tasks: JoinSet<()>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    next_generation: u64,
    /// Reports sent or still owed by spawned workers.
    pending_reports: usize,
    /// Dispatch is held back until this instant.
    dispatch_after: Instant,
    /// Whether the latest enumeration succeeded.
    enumeration_ok: bool,
}

impl InspectionScheduler {
    /// Create a new scheduler.
    pub fn new(
        config: SchedulerConfig,
        metadata: DomainMetadataManager,
        worker: InspectionWorker,
        cache: Arc<MetricsCache>,
        stats: Arc<ExporterStats>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(config.max_workers.max(1)));
        let dispatch_after = deadline_after(Instant::now(), config.startup_delay);
        Self {
            config,
            metadata,
            worker,
            cache,
            stats,
            cancellation_token,
            domains: HashMap::new(),
            slots,
            tasks: JoinSet::new(),
            completion_tx,
            completion_rx,
            next_generation: 0,
            pending_reports: 0,
            dispatch_after,
            enumeration_ok: false,
        }
    }

    /// Get the cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Scheduling state of a tracked domain.
    pub fn domain_state(&self, domain_id: &str) -> Option<DomainState> {
        self.domains
            .get(domain_id)
            .map(|t| t.state(Instant::now(), self.config.freshness_window))
    }

    pub fn tracked(&self, domain_id: &str) -> Option<&TrackedDomain> {
        self.domains.get(domain_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.domains.len()
    }

    /// Number of dispatches whose completion has not been applied yet.
    pub fn in_flight_count(&self) -> usize {
        self.domains.values().filter(|t| t.is_in_flight()).count()
    }

    /// Run until the cancellation token is triggered, then cancel all
    /// workers and wait for their sandboxes to be torn down.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            workers = self.config.max_workers,
            timeout_secs = self.config.inspection_timeout.as_secs(),
            "Starting inspection scheduler"
        );
        let delay = self.dispatch_after.saturating_duration_since(Instant::now());
        if !delay.is_zero() {
            info!(delay_secs = delay.as_secs(), "Delaying first inspections");
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wakeup = self.next_wakeup();

            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Scheduler received cancellation signal");
                    break;
                }

                _ = ticker.tick() => {
                    self.tick().await;
                }

                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion);
                    self.dispatch();
                }

                Some(joined) = self.tasks.join_next() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        error!("Inspection task panicked: {}", e);
                    }
                }

                _ = Self::wait_until(wakeup) => {
                    self.refresh_entries();
                    self.dispatch();
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Sleep until `at`, or forever if nothing is pending.
    async fn wait_until(at: Option<Instant>) {
        match at {
            Some(instant) => tokio::time::sleep_until(instant).await,
            None => std::future::pending().await,
        }
    }

    /// Earliest future instant at which a domain becomes dispatchable or its
    /// last success goes stale, without a new tick.
    fn next_wakeup(&self) -> Option<Instant> {
        if !self.enumeration_ok {
            return None;
        }
        let now = Instant::now();
        let freshness = self.config.freshness_window;
        let retry = self
            .domains
            .values()
            .filter(|t| !t.is_in_flight())
            .filter_map(|t| t.retry_at.or_else(|| t.fresh_until(freshness)))
            .filter(|at| *at > now)
            .min();
        let startup = (self.dispatch_after > now).then_some(self.dispatch_after);
        match (retry, startup) {
            (Some(r), Some(s)) => Some(r.max(s)),
            (r, s) => r.or(s),
        }
    }

    /// One scheduling tick: enumerate, reconcile, publish, dispatch.
    ///
    /// A failed enumeration leaves tracked domains and the cache untouched
    /// and suspends dispatch until the next successful tick.
    pub async fn tick(&mut self) {
        self.stats.record_tick();

        let listed = tokio::select! {
            _ = self.cancellation_token.cancelled() => return,
            listed = self.metadata.list_domains() => listed,
        };

        match listed {
            Ok(enumeration) => {
                self.enumeration_ok = true;
                self.cache.set_connection_status(ConnectionStatus::Connected);
                self.reconcile(enumeration);
            }
            Err(e) => {
                warn!(error = %e, "Domain enumeration failed, keeping cached state");
                self.enumeration_ok = false;
                self.stats.record_enumeration_error();
                self.cache.set_connection_status(ConnectionStatus::Error);
                return;
            }
        }

        self.refresh_entries();
        self.dispatch();
    }

    /// Apply an enumeration result to the tracked set.
    ///
    /// Listed domains whose metadata could not be read keep their previous
    /// record. Unresolved domains seen for the first time are not tracked.
    fn reconcile(&mut self, enumeration: Enumeration) {
        let removed: Vec<String> = self
            .domains
            .keys()
            .filter(|id| !enumeration.contains(id))
            .cloned()
            .collect();

        for id in removed {
            if let Some(mut tracked) = self.domains.remove(&id) {
                tracked.abandon();
            }
            self.cache.remove(&id);
            info!(domain = %id, "Domain no longer present, evicted");
        }

        for domain in enumeration.domains {
            match self.domains.entry(domain.domain_id.clone()) {
                Entry::Occupied(mut e) => e.get_mut().domain = domain,
                Entry::Vacant(e) => {
                    info!(
                        domain = %domain.domain_id,
                        name = %domain.name,
                        disks = domain.disks.len(),
                        "Tracking new domain"
                    );
                    e.insert(TrackedDomain::new(domain));
                }
            }
        }

        self.stats.set_domains_tracked(self.domains.len() as u64);
    }

    /// Republish entries whose derived state changed since last published.
    fn refresh_entries(&self) {
        let now = Instant::now();
        for tracked in self.domains.values() {
            let entry = cache_entry(tracked, now, self.config.freshness_window);
            let unchanged = self
                .cache
                .get(tracked.id())
                .is_some_and(|current| *current == entry);
            if !unchanged {
                self.cache.publish(entry);
            }
        }
    }

    /// Hand eligible domains to free worker slots, oldest attempt first.
    fn dispatch(&mut self) {
        let now = Instant::now();
        if !self.enumeration_ok || now < self.dispatch_after || self.cancellation_token.is_cancelled()
        {
            return;
        }

        let freshness = self.config.freshness_window;
        let mut eligible: Vec<(Option<Instant>, String)> = self
            .domains
            .values()
            .filter(|t| t.is_eligible(now, freshness))
            .map(|t| {
                let (attempt, id) = t.dispatch_key();
                (attempt, id.to_string())
            })
            .collect();
        eligible.sort();

        let waiting = eligible.len();
        for (dispatched, (_, id)) in eligible.into_iter().enumerate() {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                debug!(
                    pending = waiting - dispatched,
                    "All worker slots busy, deferring remaining domains"
                );
                break;
            };
            self.start_inspection(&id, permit, now);
        }
    }

    fn start_inspection(&mut self, domain_id: &str, permit: OwnedSemaphorePermit, now: Instant) {
        let Some(tracked) = self.domains.get_mut(domain_id) else {
            return;
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = self.cancellation_token.child_token();
        tracked.begin(generation, cancel.clone(), now);

        self.cache
            .publish(cache_entry(tracked, now, self.config.freshness_window));
        self.stats.record_inspection_started();
        debug!(domain = %domain_id, generation, "Dispatching inspection");

        let domain = tracked.domain.clone();
        let worker = self.worker.clone();
        let reporter = CompletionReporter {
            tx: self.completion_tx.clone(),
            domain_id: domain_id.to_string(),
            generation,
            started: now,
            sent: false,
        };

        self.pending_reports += 1;
        self.tasks.spawn(async move {
            let result = worker.inspect(&domain, &cancel).await;
            // The slot frees only after the sandbox is gone.
            drop(permit);
            reporter.send(result);
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            domain_id,
            generation,
            result,
            duration,
        } = completion;

        self.pending_reports = self.pending_reports.saturating_sub(1);
        self.stats.record_inspection_finished(
            outcome_label(&result),
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        );

        let Some(tracked) = self.domains.get_mut(&domain_id) else {
            debug!(domain = %domain_id, generation, "Discarding result for removed domain");
            return;
        };

        let failure = result.failure().cloned();
        let mounts = result.mounts.len();
        let now = Instant::now();
        if !tracked.complete(generation, result, &self.config.retry, now) {
            debug!(domain = %domain_id, generation, "Discarding result of superseded dispatch");
            return;
        }

        match failure {
            None => info!(
                domain = %domain_id,
                mounts,
                duration_ms = duration.as_millis() as u64,
                "Inspection succeeded"
            ),
            Some(FailureReason::Cancelled) => {
                debug!(domain = %domain_id, "Inspection cancelled");
            }
            Some(reason) => warn!(
                domain = %domain_id,
                reason = %reason,
                failures = tracked.consecutive_failures,
                retry_in_secs = tracked
                    .retry_at
                    .map(|at| at.saturating_duration_since(now).as_secs()),
                "Inspection failed"
            ),
        }

        self.cache
            .publish(cache_entry(tracked, now, self.config.freshness_window));
    }

    /// Apply the next worker report and dispatch into any freed slot.
    ///
    /// Returns `false` if there is nothing left to wait for.
    pub async fn process_next_completion(&mut self) -> bool {
        if self.pending_reports == 0 {
            return false;
        }
        match self.completion_rx.recv().await {
            Some(completion) => {
                self.handle_completion(completion);
                self.dispatch();
                true
            }
            None => false,
        }
    }

    /// Process reports until no dispatch is outstanding.
    pub async fn wait_idle(&mut self) {
        while self.in_flight_count() > 0 {
            if !self.process_next_completion().await {
                break;
            }
        }
    }

    async fn shutdown(&mut self) {
        let outstanding = self.in_flight_count();
        for tracked in self.domains.values_mut() {
            tracked.abandon();
        }

        let grace = self.config.inspection_timeout.saturating_add(SHUTDOWN_GRACE);
        let drained = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "Workers did not stop in time, aborting"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        while let Ok(completion) = self.completion_rx.try_recv() {
            self.stats.record_inspection_finished(
                outcome_label(&completion.result),
                u64::try_from(completion.duration.as_millis()).unwrap_or(u64::MAX),
            );
        }

        info!(cancelled = outstanding, "Inspection scheduler stopped");
    }
}
