//! Metrics cache and exposition.
//!
//! Holds the latest known measurement per domain and renders it for
//! Prometheus scrapes without ever running an inspection inline.
//!
//! # Features
//!
//! - Single-writer cache with whole-entry replacement and consistent snapshots
//! - Per-mount and per-domain usage gauges with failure and staleness signals
//! - Scheduler self-metrics (ticks, enumeration errors, inspection outcomes)
//! - Health checks for the hypervisor link and scheduler (/health, /health/ready)
//!
//! # Example
//!
//! ```ignore
//! use virtfs_exporter::metrics::{ExporterStats, MetricsCache, PrometheusExporter};
//!
//! let cache = Arc::new(MetricsCache::new());
//! let exporter = PrometheusExporter::new(cache.clone(), Arc::new(ExporterStats::new()));
//! let text = exporter.render();
//! ```

pub mod cache;
mod collector;
mod health;
mod prometheus;

pub use cache::{CacheEntry, CacheSnapshot, MetricsCache};
pub use collector::{ExporterStats, StatsSnapshot};
pub use health::{
    ComponentHealth, HealthCheckFn, HealthChecker, HealthStatus, HostUsage, SystemHealth,
    hypervisor_check, scheduler_check,
};
pub use prometheus::{CONTENT_TYPE, PrometheusExporter, escape_label_value};
