//! API response models (DTOs).
//!
//! # Model Categories
//!
//! - **Domain**: Tracked domains and their latest measurements
//! - **Health**: Exporter health checks

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::MountUsage;
use crate::hypervisor::ConnectionStatus;
use crate::metrics::{CacheEntry, ComponentHealth, HealthStatus, HostUsage, SystemHealth};
use crate::scheduler::DomainState;

// ============================================================================
// Domain
// ============================================================================

/// One tracked domain as seen by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct DomainSummary {
    pub domain_id: String,
    pub name: String,
    pub display_name: String,
    pub project: String,
    pub disks: Vec<String>,
    pub state: DomainState,
    pub in_flight: bool,
    pub stale: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Collection time of the latest successful inspection.
    pub last_success_at: Option<DateTime<Utc>>,
    pub bytes_used: Option<u64>,
    pub bytes_total: Option<u64>,
    pub mounts: Vec<MountUsage>,
}

impl From<&CacheEntry> for DomainSummary {
    fn from(entry: &CacheEntry) -> Self {
        let domain = &entry.domain;
        let result = entry.last_result.as_deref();
        Self {
            domain_id: domain.domain_id.clone(),
            name: domain.name.clone(),
            display_name: domain.display_name.clone(),
            project: domain.project.clone(),
            disks: domain.disk_paths().into_iter().map(str::to_string).collect(),
            state: entry.state,
            in_flight: entry.in_flight,
            stale: entry.stale,
            consecutive_failures: entry.consecutive_failures,
            last_error: entry.last_error.as_ref().map(ToString::to_string),
            last_attempt_at: entry.last_attempt_at,
            last_success_at: result.map(|r| r.collected_at),
            bytes_used: result.map(|r| r.bytes_used()),
            bytes_total: result.map(|r| r.bytes_total()),
            mounts: result.map(|r| r.mounts.clone()).unwrap_or_default(),
        }
    }
}

/// Response body of the domain list endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DomainListResponse {
    pub connection: ConnectionStatus,
    pub last_enumeration: Option<DateTime<Utc>>,
    pub total: usize,
    pub domains: Vec<DomainSummary>,
}

// ============================================================================
// Health
// ============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub host: HostUsage,
    /// Sorted by component name.
    pub components: Vec<ComponentHealth>,
}

impl From<SystemHealth> for HealthResponse {
    fn from(health: SystemHealth) -> Self {
        Self {
            status: health.status,
            version: health.version,
            uptime_secs: health.uptime_secs,
            host: health.host,
            components: health.components.into_values().collect(),
        }
    }
}
