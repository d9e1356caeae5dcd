//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::models::HealthResponse;
use crate::api::server::AppState;
use crate::metrics::{HealthStatus, HostUsage};

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let Some(health_checker) = &state.health_checker else {
        return Json(HealthResponse {
            status: HealthStatus::Unknown,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: state.start_time.elapsed().as_secs(),
            host: HostUsage::default(),
            components: vec![],
        });
    };

    Json(HealthResponse::from(health_checker.check_all()))
}

/// Readiness check: 200 once the hypervisor has been enumerated, else 503.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let is_ready = match &state.health_checker {
        Some(health_checker) => health_checker.check_ready(),
        None => state.cache.snapshot().last_enumeration.is_some(),
    };
    if is_ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Liveness check: 200 whenever the process answers.
async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}
