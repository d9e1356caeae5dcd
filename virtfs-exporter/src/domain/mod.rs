//! Core domain types shared by the hypervisor, inspector and scheduler layers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label value used when hypervisor metadata does not carry a field.
pub const UNKNOWN_LABEL: &str = "unknown";

/// One backing disk attached to a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskSource {
    /// Local path or `protocol://[user@]host[:port]/name` for network disks.
    pub location: String,
    /// Image format reported by the driver element (`raw`, `qcow2`), if any.
    pub format: Option<String>,
    /// Guest-visible target device (`vda`, `sdb`).
    pub target: String,
}

impl DiskSource {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            format: None,
            target: String::new(),
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }
}

/// Identity of a running VM as seen by the hypervisor in one enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRef {
    /// Stable identifier (libvirt UUID).
    pub domain_id: String,
    /// Hypervisor-level domain name.
    pub name: String,
    /// Instance name from cloud metadata, `unknown` when absent.
    pub display_name: String,
    /// Owning project from cloud metadata, `unknown` when absent.
    pub project: String,
    /// Attached disks in device order.
    pub disks: Vec<DiskSource>,
}

impl DomainRef {
    pub fn new(domain_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            domain_id: domain_id.into(),
            name: name.into(),
            display_name: UNKNOWN_LABEL.to_string(),
            project: UNKNOWN_LABEL.to_string(),
            disks: Vec::new(),
        }
    }

    pub fn with_disk(mut self, disk: DiskSource) -> Self {
        self.disks.push(disk);
        self
    }

    pub fn with_labels(mut self, display_name: impl Into<String>, project: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self.project = project.into();
        self
    }

    /// Disk locations in device order.
    pub fn disk_paths(&self) -> Vec<&str> {
        self.disks.iter().map(|d| d.location.as_str()).collect()
    }

    pub fn has_disks(&self) -> bool {
        !self.disks.is_empty()
    }
}

/// Usage of one mounted guest filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountUsage {
    pub mount_point: String,
    pub device: String,
    pub fs_type: String,
    pub bytes_used: u64,
    pub bytes_total: u64,
}

/// Why an inspection did not produce measurements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Disk image locked by another process. Transient contention.
    Busy,
    /// Image unreadable, corrupt, or without a recognizable filesystem.
    Unreadable(String),
    /// Inspection exceeded the hard timeout.
    Timeout,
    /// The sandbox itself could not be started or driven.
    Sandbox(String),
    /// Aborted because the domain was removed or the process is stopping.
    Cancelled,
}

impl FailureReason {
    /// Short stable label used as a metric label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Unreadable(_) => "unreadable",
            Self::Timeout => "timeout",
            Self::Sandbox(_) => "sandbox",
            Self::Cancelled => "cancelled",
        }
    }

    /// Durable failures extend the failure streak and back off exponentially.
    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::Busy | Self::Cancelled)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "disk image busy"),
            Self::Unreadable(msg) => write!(f, "unreadable: {msg}"),
            Self::Timeout => write!(f, "inspection timed out"),
            Self::Sandbox(msg) => write!(f, "sandbox failure: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum InspectionStatus {
    Success,
    Failed(FailureReason),
}

/// Outcome of inspecting one domain at one point in time. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionResult {
    pub domain_id: String,
    pub collected_at: DateTime<Utc>,
    pub mounts: Vec<MountUsage>,
    pub status: InspectionStatus,
}

impl InspectionResult {
    pub fn success(domain_id: impl Into<String>, mounts: Vec<MountUsage>) -> Self {
        Self {
            domain_id: domain_id.into(),
            collected_at: Utc::now(),
            mounts,
            status: InspectionStatus::Success,
        }
    }

    pub fn failed(domain_id: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            domain_id: domain_id.into(),
            collected_at: Utc::now(),
            mounts: Vec::new(),
            status: InspectionStatus::Failed(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, InspectionStatus::Success)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.status {
            InspectionStatus::Failed(reason) => Some(reason),
            InspectionStatus::Success => None,
        }
    }

    pub fn bytes_used(&self) -> u64 {
        self.mounts.iter().map(|m| m.bytes_used).sum()
    }

    pub fn bytes_total(&self) -> u64 {
        self.mounts.iter().map(|m| m.bytes_total).sum()
    }
}
