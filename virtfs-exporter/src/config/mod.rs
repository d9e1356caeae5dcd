//! Exporter configuration.
//!
//! Values are resolved in three layers: command line (and environment),
//! then an optional TOML file, then the defaults below. Invalid values are
//! rejected at startup rather than clamped.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::utils::fs::io_error;
use crate::utils::time::MAX_DELAY;
use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 9122;
pub const DEFAULT_ADDR: &str = "0.0.0.0";
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";
pub const DEFAULT_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_FRESHNESS_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 60;
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 6 * 60 * 60;
pub const DEFAULT_BUSY_RETRY_SECS: u64 = 30;
pub const DEFAULT_STARTUP_JITTER_SECS: u64 = 2 * 60 * 60;

/// Upper bound for every duration setting.
pub const MAX_DURATION_SECS: u64 = MAX_DELAY.as_secs();

/// Fully resolved exporter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExporterConfig {
    pub port: u16,
    pub addr: String,
    pub libvirt_uri: String,
    pub interval_secs: u64,
    pub freshness_secs: u64,
    pub workers: usize,
    pub timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub busy_retry_secs: u64,
    pub startup_jitter_secs: u64,
    pub run_now: bool,
    pub debug: bool,
    pub log_dir: Option<PathBuf>,
    /// Parent directory for per-inspection scratch directories.
    pub scratch_dir: PathBuf,
    pub virsh_bin: String,
    pub guestfish_bin: String,
    pub enable_cors: bool,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            addr: DEFAULT_ADDR.to_string(),
            libvirt_uri: DEFAULT_LIBVIRT_URI.to_string(),
            interval_secs: DEFAULT_INTERVAL_SECS,
            freshness_secs: DEFAULT_FRESHNESS_SECS,
            workers: DEFAULT_WORKERS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_max_secs: DEFAULT_BACKOFF_MAX_SECS,
            busy_retry_secs: DEFAULT_BUSY_RETRY_SECS,
            startup_jitter_secs: DEFAULT_STARTUP_JITTER_SECS,
            run_now: false,
            debug: false,
            log_dir: None,
            scratch_dir: std::env::temp_dir(),
            virsh_bin: "virsh".to_string(),
            guestfish_bin: "guestfish".to_string(),
            enable_cors: false,
        }
    }
}

impl ExporterConfig {
    /// Resolve configuration from arguments and the optional file they name.
    pub fn load(args: &Args) -> Result<Self> {
        let base = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.merge_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| io_error("reading config file", path, e))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::config(format!("invalid config file: {e}")))
    }

    /// Overlay explicitly provided arguments on top of this configuration.
    pub fn merge_args(mut self, args: &Args) -> Self {
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(addr) = &args.addr {
            self.addr = addr.clone();
        }
        if let Some(uri) = &args.uri {
            self.libvirt_uri = uri.clone();
        }
        if let Some(v) = args.interval_secs {
            self.interval_secs = v;
        }
        if let Some(v) = args.freshness_secs {
            self.freshness_secs = v;
        }
        if let Some(v) = args.workers {
            self.workers = v;
        }
        if let Some(v) = args.timeout_secs {
            self.timeout_secs = v;
        }
        if let Some(v) = args.backoff_base_secs {
            self.backoff_base_secs = v;
        }
        if let Some(v) = args.backoff_max_secs {
            self.backoff_max_secs = v;
        }
        if let Some(v) = args.busy_retry_secs {
            self.busy_retry_secs = v;
        }
        if let Some(v) = args.startup_jitter_secs {
            self.startup_jitter_secs = v;
        }
        if let Some(dir) = &args.log_dir {
            self.log_dir = Some(dir.clone());
        }
        self.run_now |= args.run_now;
        self.debug |= args.debug;
        self
    }

    /// Reject values that would make the scheduler misbehave.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("interval_secs", self.interval_secs),
            ("freshness_secs", self.freshness_secs),
            ("timeout_secs", self.timeout_secs),
            ("backoff_base_secs", self.backoff_base_secs),
            ("backoff_max_secs", self.backoff_max_secs),
            ("busy_retry_secs", self.busy_retry_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(Error::config(format!("{field} must be greater than zero")));
            }
        }
        let bounded = positive
            .into_iter()
            .chain([("startup_jitter_secs", self.startup_jitter_secs)]);
        for (field, value) in bounded {
            if value > MAX_DURATION_SECS {
                return Err(Error::config(format!(
                    "{field} ({value}) must not exceed {MAX_DURATION_SECS}"
                )));
            }
        }
        if self.workers < 1 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            return Err(Error::config(format!(
                "backoff_max_secs ({}) must not be lower than backoff_base_secs ({})",
                self.backoff_max_secs, self.backoff_base_secs
            )));
        }
        if self.libvirt_uri.trim().is_empty() {
            return Err(Error::config("libvirt_uri must not be empty"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn inspection_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn busy_retry(&self) -> Duration {
        Duration::from_secs(self.busy_retry_secs)
    }

    /// Delay before the first inspections, zero when `run_now` is set.
    pub fn startup_delay(&self) -> Duration {
        if self.run_now || self.startup_jitter_secs == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(rand::random::<u64>() % self.startup_jitter_secs)
    }
}
