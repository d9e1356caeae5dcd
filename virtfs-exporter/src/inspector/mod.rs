//! Out-of-band disk inspection.
//!
//! An [`InspectionWorker`] opens a sandbox over a domain's disks, enumerates
//! the guest filesystems and measures each one. The sandbox is always torn
//! down before the worker returns, including on timeout and cancellation.
//!
//! # Features
//!
//! - Pluggable sandbox backends via [`SandboxProvider`]
//! - Per-image exclusion so two inspections never share a disk image
//! - Hard per-inspection deadline covering sandbox start and measurement

pub mod guestfish;
pub mod locks;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{DiskSource, DomainRef, FailureReason, InspectionResult, MountUsage};
use crate::utils::time::deadline_after;

pub use guestfish::GuestfishProvider;
pub use locks::{ImageLockGuard, ImageLocks};

/// A guest filesystem found inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemSpec {
    pub device: String,
    pub fs_type: String,
    /// Guest mount point when known from OS inspection, else the device.
    pub mount_point: String,
}

/// Failures raised by a sandbox backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("disk image busy: {0}")]
    Busy(String),

    #[error("disk image unreadable: {0}")]
    Unreadable(String),

    #[error("sandbox failed: {0}")]
    Failed(String),
}

impl From<SandboxError> for FailureReason {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Busy(_) => FailureReason::Busy,
            SandboxError::Unreadable(msg) => FailureReason::Unreadable(msg),
            SandboxError::Failed(msg) => FailureReason::Sandbox(msg),
        }
    }
}

/// Opens isolated read-only sessions over disk images.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Start a sandbox with every disk attached.
    ///
    /// Dropping the returned future before completion must not leak the
    /// sandbox.
    async fn open(&self, disks: &[DiskSource]) -> Result<Box<dyn SandboxSession>, SandboxError>;
}

/// A running sandbox. Call [`SandboxSession::close`] to tear it down.
#[async_trait]
pub trait SandboxSession: Send {
    async fn list_filesystems(&mut self) -> Result<Vec<FilesystemSpec>, SandboxError>;

    /// Returns `(bytes_used, bytes_total)` for one filesystem.
    async fn stat_usage(&mut self, fs: &FilesystemSpec) -> Result<(u64, u64), SandboxError>;

    /// Tear down the sandbox. Completes only once nothing is left running.
    async fn close(self: Box<Self>);
}

/// Runs one bounded inspection at a time for a given domain.
///
/// Stateless apart from shared image locks, so one worker value can serve
/// many concurrent inspections of different domains.
#[derive(Clone)]
pub struct InspectionWorker {
    provider: Arc<dyn SandboxProvider>,
    locks: Arc<ImageLocks>,
    timeout: Duration,
}

impl InspectionWorker {
    pub fn new(provider: Arc<dyn SandboxProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            locks: ImageLocks::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Inspect `domain`'s disks.
    ///
    /// Never returns an error: every failure is folded into the result's
    /// status. Cancellation yields [`FailureReason::Cancelled`].
    pub async fn inspect(&self, domain: &DomainRef, cancel: &CancellationToken) -> InspectionResult {
        let id = domain.domain_id.as_str();
        if !domain.has_disks() {
            return InspectionResult::success(id, Vec::new());
        }

        let Some(_guard) = self.locks.try_acquire(domain.disk_paths()) else {
            debug!(domain = %id, "Disk image already under inspection");
            return InspectionResult::failed(id, FailureReason::Busy);
        };

        let deadline = deadline_after(Instant::now(), self.timeout);

        let session = tokio::select! {
            _ = cancel.cancelled() => {
                return InspectionResult::failed(id, FailureReason::Cancelled);
            }
            opened = timeout_at(deadline, self.provider.open(&domain.disks)) => match opened {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    debug!(domain = %id, error = %e, "Sandbox did not start");
                    return InspectionResult::failed(id, e.into());
                }
                Err(_) => return InspectionResult::failed(id, FailureReason::Timeout),
            },
        };

        let mut session = session;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(FailureReason::Cancelled),
            measured = timeout_at(deadline, measure(session.as_mut())) => match measured {
                Ok(Ok(mounts)) => Ok(mounts),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(FailureReason::Timeout),
            },
        };

        session.close().await;

        match outcome {
            Ok(mounts) => InspectionResult::success(id, mounts),
            Err(reason) => {
                if reason.is_durable() {
                    warn!(domain = %id, reason = %reason, "Inspection failed");
                }
                InspectionResult::failed(id, reason)
            }
        }
    }
}

/// Enumerate and measure every filesystem in an open session.
///
/// A filesystem that cannot be mounted is skipped. Contention aborts the
/// whole measurement, as does finding nothing measurable.
async fn measure(session: &mut dyn SandboxSession) -> Result<Vec<MountUsage>, SandboxError> {
    let filesystems = session.list_filesystems().await?;
    if filesystems.is_empty() {
        return Err(SandboxError::Unreadable("no recognizable filesystem".to_string()));
    }

    let mut mounts = Vec::with_capacity(filesystems.len());
    let mut last_error = None;
    for fs in &filesystems {
        match session.stat_usage(fs).await {
            Ok((bytes_used, bytes_total)) => mounts.push(MountUsage {
                mount_point: fs.mount_point.clone(),
                device: fs.device.clone(),
                fs_type: fs.fs_type.clone(),
                bytes_used,
                bytes_total,
            }),
            Err(SandboxError::Unreadable(msg)) => {
                debug!(device = %fs.device, error = %msg, "Skipping unmountable filesystem");
                last_error = Some(msg);
            }
            Err(e) => return Err(e),
        }
    }

    if mounts.is_empty() {
        return Err(SandboxError::Unreadable(
            last_error.unwrap_or_else(|| "no mountable filesystem".to_string()),
        ));
    }
    mounts.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
    Ok(mounts)
}
