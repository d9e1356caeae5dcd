//! Sandbox backend built on libguestfs' `guestfish` in remote-control mode.
//!
//! One `guestfish --listen --ro` process (and its appliance) is started per
//! inspection inside a private `TMPDIR`. Commands are sent with
//! `guestfish --remote=<pid>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{kill_pid, output_with_timeout, process_alive, tokio_command};
use regex::Regex;
use tempfile::TempDir;
use tracing::{debug, trace, warn};

use super::{FilesystemSpec, SandboxError, SandboxProvider, SandboxSession};
use crate::domain::DiskSource;
use crate::utils::fs::scratch_dir;

/// Prefix of per-inspection scratch directories.
pub const SCRATCH_PREFIX: &str = "virtfs-exporter-";

/// Bound on any single remote command, independent of the inspection deadline.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Bound on a graceful `exit` before the process is killed.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Filesystem types that never hold measurable data.
const SKIPPED_FS_TYPES: &[&str] = &["unknown", "swap"];

/// Image lock contention as reported by qemu and the kernel.
static BUSY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\block(ed)?\b|resource temporarily unavailable|device or resource busy|\bin use\b")
        .unwrap()
});

const UNREADABLE_MARKERS: &[&str] = &[
    "No such file or directory",
    "Permission denied",
    "could not open",
    "not a valid",
    "wrong fs type",
    "bad superblock",
    "no operating system",
    "Invalid argument",
];

/// Map guestfish diagnostics onto the sandbox error taxonomy.
pub fn classify_failure(diagnostic: &str) -> SandboxError {
    let msg = diagnostic.trim().to_string();
    if BUSY_PATTERN.is_match(&msg) {
        SandboxError::Busy(msg)
    } else if UNREADABLE_MARKERS.iter().any(|m| msg.contains(m)) {
        SandboxError::Unreadable(msg)
    } else {
        SandboxError::Failed(msg)
    }
}

/// Starts guestfish sandboxes.
#[derive(Debug, Clone)]
pub struct GuestfishProvider {
    bin: String,
    scratch_parent: PathBuf,
}

impl GuestfishProvider {
    pub fn new(bin: impl Into<String>, scratch_parent: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            scratch_parent: scratch_parent.into(),
        }
    }

    fn listen_args(disks: &[DiskSource]) -> Vec<String> {
        let mut args = vec!["--listen".to_string(), "--ro".to_string()];
        for disk in disks {
            match &disk.format {
                Some(format) => args.push(format!("--format={format}")),
                // Bare --format restores auto-detection for this drive.
                None => args.push("--format".to_string()),
            }
            args.push("-a".to_string());
            args.push(disk.location.clone());
        }
        args
    }
}

#[async_trait]
impl SandboxProvider for GuestfishProvider {
    async fn open(&self, disks: &[DiskSource]) -> Result<Box<dyn SandboxSession>, SandboxError> {
        let scratch = scratch_dir(&self.scratch_parent, SCRATCH_PREFIX)
            .map_err(|e| SandboxError::Failed(e.to_string()))?;

        let mut cmd = tokio_command(&self.bin);
        cmd.args(Self::listen_args(disks)).env("TMPDIR", scratch.path());
        let out = output_with_timeout(&mut cmd, COMMAND_TIMEOUT)
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))?;
        if !out.success() {
            return Err(classify_failure(out.diagnostic()));
        }
        let pid = parse_listen_pid(&out.stdout).ok_or_else(|| {
            SandboxError::Failed(format!("guestfish did not report a pid: {}", out.diagnostic()))
        })?;
        debug!(pid, disks = disks.len(), "Started guestfish");

        let mut session = GuestfishSession {
            bin: self.bin.clone(),
            pid,
            scratch: Some(scratch),
            closed: false,
        };

        // Dropping `session` on error kills the listener.
        session.remote(&["run"]).await?;
        Ok(Box::new(session))
    }
}

/// A running guestfish listener with a launched appliance.
pub struct GuestfishSession {
    bin: String,
    pid: u32,
    scratch: Option<TempDir>,
    closed: bool,
}

impl GuestfishSession {
    fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    async fn remote_with_timeout(&self, args: &[&str], timeout: Duration) -> Result<String, SandboxError> {
        let mut cmd = tokio_command(&self.bin);
        cmd.arg(format!("--remote={}", self.pid)).args(args);
        if let Some(tmp) = self.scratch_path() {
            cmd.env("TMPDIR", tmp);
        }
        trace!(pid = self.pid, ?args, "guestfish remote");
        let out = output_with_timeout(&mut cmd, timeout)
            .await
            .map_err(|e| SandboxError::Failed(e.to_string()))?;
        if !out.success() {
            return Err(classify_failure(out.diagnostic()));
        }
        Ok(out.stdout)
    }

    async fn remote(&self, args: &[&str]) -> Result<String, SandboxError> {
        self.remote_with_timeout(args, COMMAND_TIMEOUT).await
    }

    /// Guest mount points keyed by device, from OS inspection.
    async fn mountpoints(&self) -> HashMap<String, String> {
        let roots = match self.remote(&["inspect-os"]).await {
            Ok(out) => out,
            Err(e) => {
                debug!(pid = self.pid, error = %e, "OS inspection unavailable");
                return HashMap::new();
            }
        };

        let mut by_device = HashMap::new();
        for root in roots.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self.remote(&["inspect-get-mountpoints", root]).await {
                Ok(out) => {
                    for (mount_point, device) in parse_pairs(&out) {
                        by_device.entry(device).or_insert(mount_point);
                    }
                }
                Err(e) => debug!(root, error = %e, "No mountpoints for root"),
            }
        }
        by_device
    }

    fn kill(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if process_alive(self.pid) && kill_pid(self.pid) {
            debug!(pid = self.pid, "Killed guestfish");
        }
    }
}

#[async_trait]
impl SandboxSession for GuestfishSession {
    async fn list_filesystems(&mut self) -> Result<Vec<FilesystemSpec>, SandboxError> {
        let out = self.remote(&["list-filesystems"]).await?;
        let mountpoints = self.mountpoints().await;

        Ok(parse_pairs(&out)
            .into_iter()
            .filter(|(_, fs_type)| !SKIPPED_FS_TYPES.contains(&fs_type.as_str()))
            .map(|(device, fs_type)| FilesystemSpec {
                mount_point: mountpoints
                    .get(&device)
                    .cloned()
                    .unwrap_or_else(|| device.clone()),
                device,
                fs_type,
            })
            .collect())
    }

    async fn stat_usage(&mut self, fs: &FilesystemSpec) -> Result<(u64, u64), SandboxError> {
        self.remote(&["mount-ro", fs.device.as_str(), "/"]).await?;
        let stat = self.remote(&["statvfs", "/"]).await;
        if let Err(e) = self.remote(&["umount-all"]).await {
            debug!(device = %fs.device, error = %e, "umount-all failed");
        }
        parse_statvfs(&stat?)
            .ok_or_else(|| SandboxError::Unreadable(format!("unparseable statvfs for {}", fs.device)))
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.remote_with_timeout(&["exit"], TEARDOWN_TIMEOUT).await {
            debug!(pid = self.pid, error = %e, "Graceful guestfish exit failed");
        }
        if process_alive(self.pid) {
            warn!(pid = self.pid, "guestfish still running after exit, killing");
        }
        self.kill();
        // Removes the scratch directory now rather than at drop.
        if let Some(scratch) = self.scratch.take()
            && let Err(e) = scratch.close()
        {
            warn!(error = %e, "Failed to remove guestfish scratch directory");
        }
    }
}

impl Drop for GuestfishSession {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Extract the listener pid from `GUESTFISH_PID=1234; export GUESTFISH_PID`.
pub fn parse_listen_pid(stdout: &str) -> Option<u32> {
    let rest = stdout.split("GUESTFISH_PID=").nth(1)?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok().filter(|pid| *pid > 0)
}

/// Parse `key: value` lines as printed by list and hash returning commands.
pub fn parse_pairs(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(": ")?;
            let (key, value) = (key.trim(), value.trim());
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Compute `(bytes_used, bytes_total)` from `statvfs` output.
pub fn parse_statvfs(stdout: &str) -> Option<(u64, u64)> {
    let fields: HashMap<String, String> = parse_pairs(stdout).into_iter().collect();
    let get = |key: &str| fields.get(key).and_then(|v| v.parse::<u64>().ok());

    let frsize = get("frsize").filter(|v| *v > 0).or_else(|| get("bsize"))?;
    let blocks = get("blocks")?;
    let bfree = get("bfree")?.min(blocks);

    let total = blocks.saturating_mul(frsize);
    let used = (blocks - bfree).saturating_mul(frsize);
    Some((used, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_pid() {
        assert_eq!(parse_listen_pid("GUESTFISH_PID=4242; export GUESTFISH_PID\n"), Some(4242));
        assert_eq!(parse_listen_pid("nothing here"), None);
        assert_eq!(parse_listen_pid("GUESTFISH_PID=; export"), None);
    }

    #[test]
    fn parses_filesystem_list() {
        let out = "/dev/sda1: ext4\n/dev/sda2: swap\n/dev/vg/root: xfs\n";
        let pairs = parse_pairs(out);
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[2], ("/dev/vg/root".to_string(), "xfs".to_string()));
    }

    #[test]
    fn statvfs_uses_fragment_size() {
        let out = "bsize: 4096\nfrsize: 1024\nblocks: 1000\nbfree: 400\nbavail: 300\nfiles: 10\n";
        assert_eq!(parse_statvfs(out), Some((600 * 1024, 1000 * 1024)));
    }

    #[test]
    fn statvfs_falls_back_to_block_size() {
        let out = "bsize: 4096\nfrsize: 0\nblocks: 10\nbfree: 10\n";
        assert_eq!(parse_statvfs(out), Some((0, 40960)));
    }

    #[test]
    fn statvfs_missing_fields() {
        assert_eq!(parse_statvfs("bsize: 4096\n"), None);
    }

    #[test]
    fn listen_args_carry_formats() {
        let disks = vec![
            DiskSource::new("/d1").with_format("qcow2"),
            DiskSource::new("rbd://cinder@10.0.0.1:6789/volumes/v1"),
        ];
        let args = GuestfishProvider::listen_args(&disks);
        assert_eq!(
            args,
            vec![
                "--listen",
                "--ro",
                "--format=qcow2",
                "-a",
                "/d1",
                "--format",
                "-a",
                "rbd://cinder@10.0.0.1:6789/volumes/v1",
            ]
        );
    }

    #[test]
    fn classifies_lock_errors_as_busy() {
        let err = classify_failure("libguestfs: error: qemu: could not open disk: Failed to get \"write\" lock");
        assert!(matches!(err, SandboxError::Busy(_)));
    }

    #[test]
    fn block_in_message_is_not_a_lock() {
        let err = classify_failure("mount: /dev/sda1: can't read superblock, bad superblock");
        assert!(matches!(err, SandboxError::Unreadable(_)));
    }

    #[test]
    fn classifies_missing_image_as_unreadable() {
        let err = classify_failure("libguestfs: error: /d1: No such file or directory");
        assert!(matches!(err, SandboxError::Unreadable(_)));
    }

    #[test]
    fn classifies_other_errors_as_failed() {
        let err = classify_failure("libguestfs: error: appliance closed the connection unexpectedly");
        assert!(matches!(err, SandboxError::Failed(_)));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let provider = GuestfishProvider::new("/nonexistent/guestfish", dir.path());
        let err = match provider.open(&[DiskSource::new("/d1")]).await {
            Ok(_) => panic!("open should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, SandboxError::Failed(_)));
        // Scratch directory is cleaned up on the error path.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
