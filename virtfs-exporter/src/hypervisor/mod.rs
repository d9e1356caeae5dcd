//! Hypervisor access and domain metadata resolution.
//!
//! The [`Hypervisor`] trait is the capability boundary: it opens a
//! connection, lists running domains and describes each one. The
//! [`DomainMetadataManager`] turns that into the list of [`DomainRef`]s the
//! scheduler works from.

pub mod virsh;
pub mod xml;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::DomainRef;
use crate::{Error, Result};

pub use virsh::VirshHypervisor;

/// State of the hypervisor link as exported on `libvirt_connection_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No enumeration attempted yet.
    Unknown,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn gauge_value(self) -> i64 {
        match self {
            Self::Unknown => -1,
            Self::Connected => 0,
            Self::Error => 1,
        }
    }

    pub fn from_gauge(value: i64) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::Error,
            _ => Self::Unknown,
        }
    }
}

/// Factory for hypervisor connections.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Open a read-only connection. Fails with [`Error::Connection`] when
    /// the hypervisor is unreachable.
    async fn connect(&self) -> Result<Box<dyn HypervisorConnection>>;
}

/// An open read-only hypervisor connection.
#[async_trait]
pub trait HypervisorConnection: Send {
    /// Identifiers of currently running domains.
    async fn list_domain_ids(&mut self) -> Result<Vec<String>>;

    /// Resolve a domain's identity, labels and disks.
    ///
    /// Returns [`Error::DomainNotFound`] when the domain disappeared after
    /// it was listed.
    async fn describe_domain(&mut self, domain_id: &str) -> Result<DomainRef>;
}

/// Outcome of one enumeration.
#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    /// Listed domains whose metadata was resolved.
    pub domains: Vec<DomainRef>,
    /// Listed domains whose metadata could not be read this time.
    pub unresolved: Vec<String>,
}

impl Enumeration {
    /// Whether `domain_id` was listed, resolved or not.
    pub fn contains(&self, domain_id: &str) -> bool {
        self.domains.iter().any(|d| d.domain_id == domain_id)
            || self.unresolved.iter().any(|id| id == domain_id)
    }
}

/// Enumerates domains on the local hypervisor.
///
/// Holds no state between calls; every enumeration opens a fresh connection
/// so a dropped link recovers on the next cycle.
pub struct DomainMetadataManager {
    hypervisor: Arc<dyn Hypervisor>,
}

impl DomainMetadataManager {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }

    /// List running domains with their disks and labels.
    ///
    /// Domains that vanish between listing and lookup are skipped. A domain
    /// whose metadata cannot be read (bad XML, a stuck `dumpxml`) is listed
    /// as unresolved so one guest cannot stall enumeration of the others.
    /// Only a failure of the link itself aborts with a connection error.
    pub async fn list_domains(&self) -> Result<Enumeration> {
        let mut conn = self.hypervisor.connect().await.map_err(into_connection)?;
        let ids = conn.list_domain_ids().await.map_err(into_connection)?;

        let mut domains: Vec<DomainRef> = Vec::with_capacity(ids.len());
        let mut unresolved = Vec::new();
        for id in ids {
            match conn.describe_domain(&id).await {
                Ok(domain) => {
                    if domains.iter().any(|d| d.domain_id == domain.domain_id) {
                        warn!(domain = %domain.domain_id, "Duplicate domain in enumeration, ignoring");
                        continue;
                    }
                    domains.push(domain);
                }
                Err(Error::DomainNotFound(id)) => {
                    debug!(domain = %id, "Domain disappeared during enumeration");
                }
                Err(e @ Error::Connection(_)) => return Err(e),
                Err(e) => {
                    warn!(domain = %id, error = %e, "Cannot resolve domain metadata, skipping");
                    if !unresolved.contains(&id) {
                        unresolved.push(id);
                    }
                }
            }
        }

        debug!(
            count = domains.len(),
            unresolved = unresolved.len(),
            "Enumerated domains"
        );
        Ok(Enumeration {
            domains,
            unresolved,
        })
    }
}

fn into_connection(err: Error) -> Error {
    match err {
        Error::Connection(_) => err,
        other => Error::Connection(other.to_string()),
    }
}
