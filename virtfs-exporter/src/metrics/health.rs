//! Health checks for the exporter.
//!
//! Components report a status from cached state only, so a health check
//! never touches the hypervisor or a disk image. The overall status is the
//! worst component status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

use crate::hypervisor::ConnectionStatus;

use super::cache::MetricsCache;
use super::collector::ExporterStats;

/// Component name of the hypervisor check.
pub const HYPERVISOR_COMPONENT: &str = "hypervisor";

/// Component name of the scheduler check.
pub const SCHEDULER_COMPONENT: &str = "scheduler";

/// Component status, ordered from best to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving, but from data that may be out of date.
    Degraded,
    Unhealthy,
    /// Nothing registered, so nothing to judge.
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one component check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl ComponentHealth {
    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message,
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Attach a note without changing the status.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Host resource usage at the time of a check, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Aggregated health of the exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    /// Component results keyed by component name.
    pub components: BTreeMap<String, ComponentHealth>,
    pub version: String,
    pub uptime_secs: u64,
    pub host: HostUsage,
}

impl SystemHealth {
    /// Scrapes can be served: every component is at worst degraded.
    pub fn is_ready(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// A registered component check.
pub type HealthCheckFn = Arc<dyn Fn() -> ComponentHealth + Send + Sync>;

/// Hypervisor link health from the cached connection status.
///
/// An enumeration failure after an earlier success is degraded, since the
/// cache still serves the last known measurements. Without any successful
/// enumeration the component is unhealthy, which keeps readiness false.
pub fn hypervisor_check(cache: Arc<MetricsCache>) -> HealthCheckFn {
    Arc::new(move || {
        let snapshot = cache.snapshot();
        match (snapshot.connection, snapshot.last_enumeration) {
            (ConnectionStatus::Connected, _) => ComponentHealth::healthy(HYPERVISOR_COMPONENT),
            (ConnectionStatus::Error, Some(at)) => ComponentHealth::degraded(
                HYPERVISOR_COMPONENT,
                format!("last enumeration failed, serving data from {}", at.to_rfc3339()),
            ),
            (ConnectionStatus::Error, None) => {
                ComponentHealth::unhealthy(HYPERVISOR_COMPONENT, "hypervisor unreachable")
            }
            (ConnectionStatus::Unknown, _) => {
                ComponentHealth::unhealthy(HYPERVISOR_COMPONENT, "no enumeration yet")
            }
        }
    })
}

/// Scheduler liveness from its tick counter.
pub fn scheduler_check(stats: Arc<ExporterStats>) -> HealthCheckFn {
    Arc::new(move || {
        if stats.ticks_total() == 0 {
            return ComponentHealth::degraded(SCHEDULER_COMPONENT, "scheduler has not ticked yet");
        }
        let health = ComponentHealth::healthy(SCHEDULER_COMPONENT);
        match stats.inspections_in_flight() {
            0 => health,
            n => health.with_message(format!("{n} inspection(s) in flight")),
        }
    })
}

fn sample_host(system: &mut System) -> HostUsage {
    system.refresh_cpu_all();
    system.refresh_memory();

    let total = system.total_memory();
    let memory_percent = if total == 0 {
        0.0
    } else {
        (system.used_memory() as f64 / total as f64 * 100.0) as f32
    };
    HostUsage {
        cpu_percent: system.global_cpu_usage(),
        memory_percent,
    }
}

/// Runs registered component checks and samples host usage.
pub struct HealthChecker {
    checks: RwLock<BTreeMap<String, HealthCheckFn>>,
    started: Instant,
    system: Mutex<System>,
}

impl HealthChecker {
    pub fn new() -> Self {
        let refresh = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
            .with_memory(MemoryRefreshKind::nothing().with_ram());
        Self {
            checks: RwLock::new(BTreeMap::new()),
            started: Instant::now(),
            system: Mutex::new(System::new_with_specifics(refresh)),
        }
    }

    /// A checker with the hypervisor and scheduler checks registered.
    pub fn for_exporter(cache: Arc<MetricsCache>, stats: Arc<ExporterStats>) -> Self {
        let checker = Self::new();
        checker.register(HYPERVISOR_COMPONENT, hypervisor_check(cache));
        checker.register(SCHEDULER_COMPONENT, scheduler_check(stats));
        checker
    }

    /// Register a check, replacing any previous check of the same name.
    pub fn register(&self, name: impl Into<String>, check: HealthCheckFn) {
        self.checks.write().insert(name.into(), check);
    }

    /// Run every registered check.
    pub fn check_all(&self) -> SystemHealth {
        let components: BTreeMap<String, ComponentHealth> = self
            .checks
            .read()
            .iter()
            .map(|(name, check)| (name.clone(), check()))
            .collect();

        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or_default();
        let host = sample_host(&mut self.system.lock());

        debug!(status = %status, components = components.len(), "Health check finished");

        SystemHealth {
            status,
            components,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            host,
        }
    }

    pub fn check_ready(&self) -> bool {
        self.check_all().is_ready()
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
