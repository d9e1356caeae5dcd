//! virtfs-exporter library crate.
//!
//! Collects per-domain guest filesystem usage on a libvirt host in the
//! background and serves the latest measurements to Prometheus.

pub mod api;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod hypervisor;
pub mod inspector;
pub mod logging;
pub mod metrics;
pub mod scheduler;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
