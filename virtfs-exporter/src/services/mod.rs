//! Service layer module.
//!
//! This module provides the service container that wires the exporter's
//! components together and runs them until shutdown.

pub mod container;

pub use container::{ServiceContainer, shutdown_signal};
