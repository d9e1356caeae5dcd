//! End-to-end scheduler tests.
//!
//! Drive the inspection scheduler against in-memory hypervisor and sandbox
//! backends with paused tokio time, then check the cache and the rendered
//! exposition text.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use virtfs_exporter::domain::{DiskSource, DomainRef};
use virtfs_exporter::hypervisor::{DomainMetadataManager, Hypervisor, HypervisorConnection};
use virtfs_exporter::inspector::{
    FilesystemSpec, InspectionWorker, SandboxError, SandboxProvider, SandboxSession,
};
use virtfs_exporter::metrics::{ExporterStats, MetricsCache, PrometheusExporter};
use virtfs_exporter::scheduler::{DomainState, InspectionScheduler, RetryPolicy, SchedulerConfig};
use virtfs_exporter::{Error, Result};

const TIMEOUT: Duration = Duration::from_secs(60);
const FRESHNESS: Duration = Duration::from_secs(3600);

// ========== Fake hypervisor ==========

struct FakeHypervisor {
    state: Mutex<(Vec<DomainRef>, bool)>,
    /// Listed ids whose metadata cannot be parsed.
    broken: Mutex<Vec<String>>,
}

impl FakeHypervisor {
    fn new(domains: Vec<DomainRef>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new((domains, true)),
            broken: Mutex::new(Vec::new()),
        })
    }

    fn set_broken(&self, ids: &[&str]) {
        *self.broken.lock() = ids.iter().map(|id| id.to_string()).collect();
    }

    fn set_domains(&self, domains: Vec<DomainRef>) {
        self.state.lock().0 = domains;
    }

    fn set_reachable(&self, reachable: bool) {
        self.state.lock().1 = reachable;
    }
}

struct FakeConnection {
    domains: Vec<DomainRef>,
    broken: Vec<String>,
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn connect(&self) -> Result<Box<dyn HypervisorConnection>> {
        let (domains, reachable) = self.state.lock().clone();
        if !reachable {
            return Err(Error::connection("libvirtd not running"));
        }
        let broken = self.broken.lock().clone();
        Ok(Box::new(FakeConnection { domains, broken }))
    }
}

#[async_trait]
impl HypervisorConnection for FakeConnection {
    async fn list_domain_ids(&mut self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.domains.iter().map(|d| d.domain_id.clone()).collect();
        for id in &self.broken {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        Ok(ids)
    }

    async fn describe_domain(&mut self, domain_id: &str) -> Result<DomainRef> {
        if self.broken.iter().any(|id| id == domain_id) {
            return Err(Error::parse("domain xml", "missing <uuid>"));
        }
        self.domains
            .iter()
            .find(|d| d.domain_id == domain_id)
            .cloned()
            .ok_or_else(|| Error::DomainNotFound(domain_id.to_string()))
    }
}

// ========== Fake sandbox ==========

#[derive(Clone)]
enum Behavior {
    Mount {
        mounts: Vec<(&'static str, u64, u64)>,
        delay: Duration,
    },
    Hang,
    Busy,
    Unreadable,
}

impl Behavior {
    fn mount(mount_point: &'static str, used: u64, total: u64) -> Self {
        Self::Mount {
            mounts: vec![(mount_point, used, total)],
            delay: Duration::ZERO,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self::Mount {
            mounts: vec![("/", 1, 2)],
            delay,
        }
    }
}

#[derive(Default)]
struct SandboxState {
    behaviors: HashMap<String, Behavior>,
    active: HashMap<String, usize>,
    max_active_per_disk: usize,
    active_total: usize,
    max_active_total: usize,
    opened: Vec<String>,
    closed: usize,
}

#[derive(Clone, Default)]
struct FakeSandbox {
    state: Arc<Mutex<SandboxState>>,
}

impl FakeSandbox {
    fn set(&self, disk: &str, behavior: Behavior) {
        self.state.lock().behaviors.insert(disk.to_string(), behavior);
    }

    fn opened(&self) -> Vec<String> {
        self.state.lock().opened.clone()
    }

    fn closed(&self) -> usize {
        self.state.lock().closed
    }

    fn max_active_per_disk(&self) -> usize {
        self.state.lock().max_active_per_disk
    }

    fn max_active_total(&self) -> usize {
        self.state.lock().max_active_total
    }
}

struct FakeSession {
    disk: String,
    behavior: Behavior,
    state: Arc<Mutex<SandboxState>>,
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn open(&self, disks: &[DiskSource]) -> std::result::Result<Box<dyn SandboxSession>, SandboxError> {
        let disk = disks[0].location.clone();
        let mut state = self.state.lock();
        let behavior = state
            .behaviors
            .get(&disk)
            .cloned()
            .unwrap_or_else(|| Behavior::mount("/", 1, 2));
        if let Behavior::Busy = behavior {
            return Err(SandboxError::Busy(format!("{disk}: lock held by qemu")));
        }

        state.opened.push(disk.clone());
        let active = state.active.entry(disk.clone()).or_default();
        *active += 1;
        let active = *active;
        state.max_active_per_disk = state.max_active_per_disk.max(active);
        state.active_total += 1;
        state.max_active_total = state.max_active_total.max(state.active_total);

        Ok(Box::new(FakeSession {
            disk,
            behavior,
            state: Arc::clone(&self.state),
        }))
    }
}

#[async_trait]
impl SandboxSession for FakeSession {
    async fn list_filesystems(&mut self) -> std::result::Result<Vec<FilesystemSpec>, SandboxError> {
        match &self.behavior {
            Behavior::Hang => std::future::pending().await,
            Behavior::Unreadable | Behavior::Busy => Ok(Vec::new()),
            Behavior::Mount { mounts, delay } => {
                tokio::time::sleep(*delay).await;
                Ok(mounts
                    .iter()
                    .map(|(mp, _, _)| FilesystemSpec {
                        device: "/dev/sda1".into(),
                        fs_type: "ext4".into(),
                        mount_point: (*mp).to_string(),
                    })
                    .collect())
            }
        }
    }

    async fn stat_usage(&mut self, fs: &FilesystemSpec) -> std::result::Result<(u64, u64), SandboxError> {
        match &self.behavior {
            Behavior::Mount { mounts, .. } => mounts
                .iter()
                .find(|(mp, _, _)| *mp == fs.mount_point)
                .map(|(_, used, total)| (*used, *total))
                .ok_or_else(|| SandboxError::Unreadable(fs.mount_point.clone())),
            _ => Err(SandboxError::Unreadable(fs.mount_point.clone())),
        }
    }

    async fn close(self: Box<Self>) {
        let mut state = self.state.lock();
        if let Some(active) = state.active.get_mut(&self.disk) {
            *active -= 1;
        }
        state.active_total -= 1;
        state.closed += 1;
    }
}

// ========== Harness ==========

fn vm(id: &str) -> DomainRef {
    DomainRef::new(id, format!("instance-{id}")).with_disk(DiskSource::new(format!("/d/{id}")))
}

fn disk(id: &str) -> String {
    format!("/d/{id}")
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        base_backoff: Duration::from_secs(10),
        max_backoff: Duration::from_secs(1000),
        busy_retry: Duration::from_secs(5),
    }
}

struct Harness {
    scheduler: InspectionScheduler,
    cache: Arc<MetricsCache>,
    exporter: PrometheusExporter,
    hypervisor: Arc<FakeHypervisor>,
    sandbox: FakeSandbox,
}

fn config(workers: usize, startup_delay: Duration) -> SchedulerConfig {
    SchedulerConfig {
        interval: Duration::from_secs(300),
        freshness_window: FRESHNESS,
        max_workers: workers,
        inspection_timeout: TIMEOUT,
        retry: policy(),
        startup_delay,
    }
}

fn harness_with(domains: Vec<DomainRef>, workers: usize, startup_delay: Duration) -> Harness {
    harness_for(domains, config(workers, startup_delay))
}

fn harness_for(domains: Vec<DomainRef>, config: SchedulerConfig) -> Harness {
    let hypervisor = FakeHypervisor::new(domains);
    let sandbox = FakeSandbox::default();
    let cache = Arc::new(MetricsCache::new());
    let stats = Arc::new(ExporterStats::new());
    let scheduler = InspectionScheduler::new(
        config,
        DomainMetadataManager::new(hypervisor.clone()),
        InspectionWorker::new(Arc::new(sandbox.clone()), TIMEOUT),
        Arc::clone(&cache),
        Arc::clone(&stats),
        CancellationToken::new(),
    );
    let exporter = PrometheusExporter::new(Arc::clone(&cache), stats);
    Harness {
        scheduler,
        cache,
        exporter,
        hypervisor,
        sandbox,
    }
}

fn harness(domains: Vec<DomainRef>, workers: usize) -> Harness {
    harness_with(domains, workers, Duration::ZERO)
}

/// The used-bytes sample for a domain and mount, if rendered.
fn used_bytes(output: &str, id: &str, mount_point: &str) -> Option<u64> {
    output
        .lines()
        .filter(|l| l.starts_with("virtfs_filesystem_used_bytes{"))
        .filter(|l| l.contains(&format!("uuid=\"{id}\"")))
        .find(|l| l.contains(&format!("mount_point=\"{mount_point}\"")))
        .and_then(|l| l.rsplit(' ').next())
        .and_then(|v| v.parse().ok())
}

fn retry_in(h: &Harness, id: &str) -> Duration {
    h.scheduler
        .tracked(id)
        .and_then(|t| t.retry_at)
        .map(|at| at.saturating_duration_since(Instant::now()))
        .unwrap_or_default()
}

mod scenario_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn two_domains_render_their_measurements() {
        let mut h = harness(vec![vm("vm1"), vm("vm2")], 2);
        h.sandbox.set(&disk("vm1"), Behavior::mount("/mnt", 500, 1000));
        h.sandbox.set(&disk("vm2"), Behavior::mount("/mnt", 250, 1000));

        h.scheduler.tick().await;
        h.scheduler.wait_idle().await;

        let output = h.exporter.render();
        assert_eq!(output.matches("virtfs_filesystem_used_bytes{").count(), 2);
        assert_eq!(used_bytes(&output, "vm1", "/mnt"), Some(500));
        assert_eq!(used_bytes(&output, "vm2", "/mnt"), Some(250));
        assert!(output.contains("fs_type=\"ext4\"} 1000"));
        assert_eq!(h.scheduler.domain_state("vm1"), Some(DomainState::Fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timeouts_back_off_and_keep_nothing() {
        let mut h = harness(vec![vm("vm1")], 1);
        h.sandbox.set(&disk("vm1"), Behavior::Hang);

        let mut delays = Vec::new();
        for _ in 0..3 {
            h.scheduler.tick().await;
            h.scheduler.wait_idle().await;
            delays.push(retry_in(&h, "vm1"));
            tokio::time::advance(Duration::from_secs(300)).await;
        }

        let tracked = h.scheduler.tracked("vm1").unwrap();
        assert_eq!(tracked.consecutive_failures, 3);
        assert!(tracked.last_result.is_none());
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40)
            ]
        );
        assert!(delays[2] > delays[0]);
        // Every timed-out sandbox was torn down.
        assert_eq!(h.sandbox.closed(), h.sandbox.opened().len());

        let output = h.exporter.render();
        assert!(used_bytes(&output, "vm1", "/").is_none());
        assert!(output.contains("virtfs_inspection_consecutive_failures{domain=\"instance-vm1\""));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_after_success_keep_serving_last_result() {
        let mut h = harness(vec![vm("vm1")], 1);
        h.sandbox.set(&disk("vm1"), Behavior::mount("/", 700, 900));
        h.scheduler.tick().await;
        h.scheduler.wait_idle().await;

        h.sandbox.set(&disk("vm1"), Behavior::Hang);
        tokio::time::advance(FRESHNESS + Duration::from_secs(1)).await;
        h.scheduler.tick().await;
        h.scheduler.wait_idle().await;

        let entry = h.cache.get("vm1").unwrap();
        assert_eq!(entry.consecutive_failures, 1);
        assert_eq!(entry.state, DomainState::Backoff);
        assert!(entry.stale);

        let output = h.exporter.render();
        assert_eq!(used_bytes(&output, "vm1", "/"), Some(700));
        let stale = output
            .lines()
            .find(|l| l.starts_with("virtfs_inspection_stale{domain=\"instance-vm1\""))
            .unwrap();
        assert!(stale.ends_with(" 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn removed_domain_disappears_within_one_tick() {
        let mut h = harness(vec![vm("vm1"), vm("vm2")], 2);
        h.scheduler.tick().await;
        h.scheduler.wait_idle().await;
        assert!(h.exporter.render().contains("uuid=\"vm2\""));

        h.hypervisor.set_domains(vec![vm("vm1")]);
        h.scheduler.tick().await;

        let output = h.exporter.render();
        assert!(!output.contains("vm2"));
        assert!(output.contains("uuid=\"vm1\""));
        assert!(h.cache.get("vm2").is_none());
        assert_eq!(h.scheduler.tracked_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_slot_dispatches_oldest_attempt_first() {
        let mut h = harness(vec![vm("a"), vm("z")], 1);
        for id in ["a", "m", "z"] {
            h.sandbox.set(&disk(id), Behavior::slow(Duration::from_secs(10)));
        }

        h.scheduler.tick().await;
        assert_eq!(h.scheduler.domain_state("a"), Some(DomainState::InFlight));
        assert_eq!(h.scheduler.domain_state("z"), Some(DomainState::Pending));
        assert_eq!(h.cache.get("z").unwrap().state, DomainState::Pending);

        assert!(h.scheduler.process_next_completion().await);
        assert_eq!(h.scheduler.domain_state("a"), Some(DomainState::Fresh));
        assert_eq!(h.scheduler.domain_state("z"), Some(DomainState::InFlight));
        h.scheduler.wait_idle().await;

        // Both results expire; a new domain joins. Never-attempted first,
        // then the oldest attempt.
        tokio::time::advance(FRESHNESS + Duration::from_secs(30)).await;
        h.hypervisor.set_domains(vec![vm("a"), vm("m"), vm("z")]);
        h.scheduler.tick().await;
        h.scheduler.wait_idle().await;

        let order: Vec<String> = h.sandbox.opened();
        assert_eq!(order, vec![disk("a"), disk("z"), disk("m"), disk("a"), disk("z")]);
        assert_eq!(h.sandbox.max_active_total(), 1);
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn busy_retries_on_fixed_interval_without_streak() {
        let mut h = harness(vec![vm("vm1")], 1);
        h.sandbox.set(&disk("vm1"), Behavior::Busy);

        for _ in 0..5 {
            h.scheduler.tick().await;
            h.scheduler.wait_idle().await;
            assert_eq!(retry_in(&h, "vm1"), Duration::from_secs(5));
            tokio::time::advance(Duration::from_secs(5)).await;
        }

        let entry = h.cache.get("vm1").unwrap();
        assert_eq!(entry.consecutive_failures, 0);
        assert!(entry.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_image_is_durable_failure() {
        let mut h = harness(vec![vm("vm1")], 1);
        h.sandbox.set(&disk("vm1"), Behavior::Unreadable);

        h.scheduler.tick().await;
        h.scheduler.wait_idle().await;

        let tracked = h.scheduler.tracked("vm1").unwrap();
        assert_eq!(tracked.consecutive_failures, 1);
        assert_eq!(h.scheduler.domain_state("vm1"), Some(DomainState::Backoff));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_preserves_cache_and_suspends_dispatch() {
        let mut h = harness(vec![vm("vm1"), vm("vm2")], 2);
        h.scheduler.tick().await;
        h.scheduler.wait_idle().await;
        let before = h.cache.snapshot();
        let opened = h.sandbox.opened().len();

        h.hypervisor.set_reachable(false);
        tokio::time::advance(FRESHNESS + Duration::from_secs(1)).await;
        h.scheduler.tick().await;

        let after = h.cache.snapshot();
        assert_eq!(before.entries.len(), after.entries.len());
        for (b, a) in before.entries.iter().zip(after.entries.iter()) {
            assert!(Arc::ptr_eq(b, a));
        }
        assert_eq!(h.scheduler.in_flight_count(), 0);
        assert_eq!(h.sandbox.opened().len(), opened);
        assert!(h.exporter.render().contains("libvirt_connection_status{node_exporter=\"virtfs\"} 1"));

        h.hypervisor.set_reachable(true);
        h.scheduler.tick().await;
        assert_eq!(h.scheduler.in_flight_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_metadata_stays_local_to_its_domain() {
        let mut h = harness(vec![vm("vm1"), vm("vm2")], 2);
        h.sandbox.set(&disk("vm2"), Behavior::mount("/", 40, 80));
        h.scheduler.tick().await;
        h.scheduler.wait_idle().await;

        // vm2's XML turns unreadable and a new vm3 is unreadable from the start.
        h.hypervisor.set_broken(&["vm2", "vm3"]);
        tokio::time::advance(FRESHNESS + Duration::from_secs(1)).await;
        h.scheduler.tick().await;

        assert!(h.exporter.render().contains("libvirt_connection_status{node_exporter=\"virtfs\"} 0"));
        assert_eq!(h.scheduler.domain_state("vm1"), Some(DomainState::InFlight));
        assert!(h.scheduler.tracked("vm2").is_some());
        assert!(h.scheduler.tracked("vm3").is_none());
        h.scheduler.wait_idle().await;

        let output = h.exporter.render();
        assert_eq!(used_bytes(&output, "vm2", "/"), Some(40));
        assert!(!output.contains("vm3"));
    }

    #[tokio::test(start_paused = true)]
    async fn diskless_domain_is_tracked_but_never_inspected() {
        let mut h = harness(vec![DomainRef::new("vm0", "instance-vm0")], 1);
        h.scheduler.tick().await;
        h.scheduler.wait_idle().await;

        assert_eq!(h.scheduler.domain_state("vm0"), Some(DomainState::Diskless));
        assert!(h.sandbox.opened().is_empty());
        assert!(!h.exporter.render().contains("virtfs_filesystem_used_bytes"));
    }
}

mod concurrency_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn never_two_sandboxes_per_disk() {
        let all = ["a", "b", "c", "d", "e"];
        let mut h = harness(all.iter().map(|id| vm(id)).collect(), 3);
        h.sandbox.set(&disk("a"), Behavior::Hang);
        h.sandbox.set(&disk("b"), Behavior::slow(Duration::from_secs(90)));
        h.sandbox.set(&disk("c"), Behavior::Busy);
        h.sandbox.set(&disk("d"), Behavior::slow(Duration::from_secs(7)));

        for round in 0..24usize {
            let present: Vec<DomainRef> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| (round + i) % 4 != 0)
                .map(|(_, id)| vm(id))
                .collect();
            h.hypervisor.set_domains(present);
            h.scheduler.tick().await;
            assert!(h.scheduler.in_flight_count() <= 3);

            let _ = tokio::time::timeout(Duration::from_secs(45), async {
                while h.scheduler.process_next_completion().await {}
            })
            .await;
            tokio::time::advance(Duration::from_secs(FRESHNESS.as_secs() / 4)).await;
        }

        h.hypervisor.set_domains(Vec::new());
        h.scheduler.tick().await;
        while h.scheduler.process_next_completion().await {}

        assert_eq!(h.sandbox.max_active_per_disk(), 1);
        assert!(h.sandbox.max_active_total() <= 3);
        assert_eq!(h.sandbox.closed(), h.sandbox.opened().len());
        assert!(h.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn render_is_stable_between_scheduler_activity() {
        let mut h = harness(vec![vm("vm1"), vm("vm2"), vm("vm3")], 2);
        h.sandbox.set(&disk("vm3"), Behavior::Hang);
        h.scheduler.tick().await;
        h.scheduler.wait_idle().await;

        assert_eq!(h.exporter.render(), h.exporter.render());
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_workers_and_tears_down_sandboxes() {
        let h = harness(vec![vm("vm1"), vm("vm2")], 2);
        h.sandbox.set(&disk("vm1"), Behavior::Hang);
        h.sandbox.set(&disk("vm2"), Behavior::slow(Duration::from_secs(600)));

        let Harness {
            mut scheduler,
            sandbox,
            ..
        } = h;
        let token = scheduler.cancellation_token();
        let handle = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sandbox.opened().len(), 2);

        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(sandbox.closed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_delay_holds_back_first_inspections() {
        let h = harness_with(vec![vm("vm1")], 1, Duration::from_secs(100));
        let Harness {
            mut scheduler,
            sandbox,
            cache,
            ..
        } = h;
        let token = scheduler.cancellation_token();
        let handle = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(sandbox.opened().is_empty());
        assert_eq!(cache.get("vm1").unwrap().state, DomainState::Pending);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sandbox.opened(), vec![disk("vm1")]);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn busy_domain_retries_without_waiting_for_tick() {
        let h = harness(vec![vm("vm1")], 1);
        h.sandbox.set(&disk("vm1"), Behavior::Busy);
        let Harness {
            mut scheduler,
            sandbox,
            cache,
            ..
        } = h;
        let token = scheduler.cancellation_token();
        let handle = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        sandbox.set(&disk("vm1"), Behavior::mount("/", 3, 4));
        tokio::time::sleep(Duration::from_secs(10)).await;

        let entry = cache.get("vm1").unwrap();
        assert_eq!(entry.state, DomainState::Fresh);
        assert_eq!(entry.last_result.as_ref().unwrap().bytes_used(), 3);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_freshness_redispatches_between_ticks() {
        let config = SchedulerConfig {
            interval: FRESHNESS * 2,
            ..config(1, Duration::ZERO)
        };
        let h = harness_for(vec![vm("vm1")], config);
        h.sandbox.set(&disk("vm1"), Behavior::mount("/", 3, 4));
        let Harness {
            mut scheduler,
            sandbox,
            cache,
            ..
        } = h;
        let token = scheduler.cancellation_token();
        let handle = tokio::spawn(async move { scheduler.run().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.get("vm1").unwrap().state, DomainState::Fresh);
        sandbox.set(&disk("vm1"), Behavior::Hang);

        // Well before the second tick, but past the freshness window.
        tokio::time::sleep(FRESHNESS + Duration::from_secs(30)).await;
        assert_eq!(sandbox.opened().len(), 2);
        let entry = cache.get("vm1").unwrap();
        assert_eq!(entry.state, DomainState::InFlight);
        assert!(entry.stale);
        assert_eq!(entry.last_result.as_ref().unwrap().bytes_used(), 3);

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}

mod container_tests {
    use super::*;
    use virtfs_exporter::config::ExporterConfig;
    use virtfs_exporter::hypervisor::ConnectionStatus;
    use virtfs_exporter::services::ServiceContainer;

    #[tokio::test]
    async fn container_serves_until_cancelled() {
        let hypervisor = FakeHypervisor::new(vec![vm("vm1")]);
        let sandbox = FakeSandbox::default();
        sandbox.set(&disk("vm1"), Behavior::mount("/", 5, 10));
        let config = ExporterConfig {
            addr: "127.0.0.1".into(),
            port: 0,
            run_now: true,
            ..ExporterConfig::default()
        };

        let container =
            ServiceContainer::with_backends(&config, hypervisor, Arc::new(sandbox)).unwrap();
        let cache = Arc::clone(&container.cache);
        let token = container.cancellation_token();
        let handle = tokio::spawn(container.run());

        let fresh = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if cache
                    .get("vm1")
                    .is_some_and(|e| e.state == DomainState::Fresh)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(fresh.is_ok());
        assert_eq!(cache.connection_status(), ConnectionStatus::Connected);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn container_rejects_invalid_config() {
        let config = ExporterConfig {
            workers: 0,
            ..ExporterConfig::default()
        };
        let result = ServiceContainer::with_backends(
            &config,
            FakeHypervisor::new(Vec::new()),
            Arc::new(FakeSandbox::default()),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
