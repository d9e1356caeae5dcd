//! API route modules.
//!
//! Organizes routes by resource type.

pub mod domains;
pub mod health;
pub mod metrics;

use axum::Router;

use crate::api::server::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(metrics::router())
        .nest("/api/domains", domains::router())
        .nest("/health", health::router())
        .with_state(state)
}
