//! Exporter self-metrics.
//!
//! Counters and gauges describing the scheduler itself, updated by the
//! scheduler and read by the Prometheus renderer and the health checks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Scheduler activity counters.
#[derive(Debug, Default)]
pub struct ExporterStats {
    ticks_total: AtomicU64,
    enumeration_errors_total: AtomicU64,
    inspections_total: DashMap<String, AtomicU64>,
    inspection_duration_total_ms: AtomicU64,
    inspections_in_flight: AtomicU64,
    domains_tracked: AtomicU64,
}

impl ExporterStats {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Scheduler ==========

    /// Record a scheduler tick.
    pub fn record_tick(&self) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed domain enumeration.
    pub fn record_enumeration_error(&self) {
        self.enumeration_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_domains_tracked(&self, count: u64) {
        self.domains_tracked.store(count, Ordering::Relaxed);
    }

    // ========== Inspections ==========

    /// Record an inspection handed to a worker.
    pub fn record_inspection_started(&self) {
        self.inspections_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished inspection by outcome label.
    pub fn record_inspection_finished(&self, outcome: &str, duration_ms: u64) {
        // Saturating decrement; completions of abandoned dispatches still land here.
        let _ = self
            .inspections_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        self.inspection_duration_total_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.inspections_total
            .entry(outcome.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks_total(&self) -> u64 {
        self.ticks_total.load(Ordering::Relaxed)
    }

    pub fn inspections_in_flight(&self) -> u64 {
        self.inspections_in_flight.load(Ordering::Relaxed)
    }

    pub fn inspections(&self, outcome: &str) -> u64 {
        self.inspections_total
            .get(outcome)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            enumeration_errors_total: self.enumeration_errors_total.load(Ordering::Relaxed),
            inspections_total: self
                .inspections_total
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            inspection_duration_total_ms: self.inspection_duration_total_ms.load(Ordering::Relaxed),
            inspections_in_flight: self.inspections_in_flight.load(Ordering::Relaxed),
            domains_tracked: self.domains_tracked.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of exporter counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub ticks_total: u64,
    pub enumeration_errors_total: u64,
    pub inspections_total: HashMap<String, u64>,
    pub inspection_duration_total_ms: u64,
    pub inspections_in_flight: u64,
    pub domains_tracked: u64,
}
