//! Latest known measurements per domain.
//!
//! The scheduler is the only writer. Each update replaces a domain's whole
//! [`CacheEntry`] behind an `Arc`, and [`MetricsCache::snapshot`] copies the
//! map under one read lock, so a reader sees every domain as of a single
//! point in time and never a half-written entry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::domain::{DomainRef, FailureReason, InspectionResult};
use crate::hypervisor::ConnectionStatus;
use crate::scheduler::DomainState;

/// Published view of one domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub domain: DomainRef,
    pub state: DomainState,
    /// Most recent successful inspection.
    pub last_result: Option<Arc<InspectionResult>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<FailureReason>,
    pub in_flight: bool,
    /// A success exists but is overdue or followed by a failure.
    pub stale: bool,
}

impl CacheEntry {
    pub fn domain_id(&self) -> &str {
        &self.domain.domain_id
    }
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<String, Arc<CacheEntry>>,
    connection: ConnectionStatus,
    last_enumeration: Option<DateTime<Utc>>,
}

/// Point-in-time copy of the cache.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    /// Entries sorted by domain id.
    pub entries: Vec<Arc<CacheEntry>>,
    pub connection: ConnectionStatus,
    pub last_enumeration: Option<DateTime<Utc>>,
}

/// Concurrent-read, single-writer store of per-domain entries.
#[derive(Debug)]
pub struct MetricsCache {
    state: RwLock<CacheState>,
}

impl Default for MetricsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                connection: ConnectionStatus::Unknown,
                last_enumeration: None,
            }),
        }
    }

    /// Replace the entry for its domain.
    pub fn publish(&self, entry: CacheEntry) {
        let entry = Arc::new(entry);
        self.state
            .write()
            .entries
            .insert(entry.domain_id().to_string(), entry);
    }

    /// Drop a domain. Returns whether it was present.
    pub fn remove(&self, domain_id: &str) -> bool {
        self.state.write().entries.remove(domain_id).is_some()
    }

    /// Record the outcome of an enumeration attempt.
    pub fn set_connection_status(&self, status: ConnectionStatus) {
        let mut state = self.state.write();
        state.connection = status;
        if status == ConnectionStatus::Connected {
            state.last_enumeration = Some(Utc::now());
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.state.read().connection
    }

    pub fn get(&self, domain_id: &str) -> Option<Arc<CacheEntry>> {
        self.state.read().entries.get(domain_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent copy of every entry plus connection state.
    pub fn snapshot(&self) -> CacheSnapshot {
        let (mut entries, connection, last_enumeration) = {
            let state = self.state.read();
            (
                state.entries.values().cloned().collect::<Vec<_>>(),
                state.connection,
                state.last_enumeration,
            )
        };
        entries.sort_by(|a, b| a.domain_id().cmp(b.domain_id()));
        CacheSnapshot {
            entries,
            connection,
            last_enumeration,
        }
    }
}
