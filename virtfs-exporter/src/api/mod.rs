//! HTTP API server module.
//!
//! Serves the Prometheus scrape endpoint, health checks, and a read-only
//! JSON view of tracked domains.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
