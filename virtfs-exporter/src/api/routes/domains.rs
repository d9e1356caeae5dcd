//! Tracked domain routes.
//!
//! Read-only view over the metrics cache. Nothing here triggers an
//! inspection.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{DomainListResponse, DomainSummary};
use crate::api::server::AppState;

/// Create the domains router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_domains))
        .route("/{id}", get(get_domain))
}

/// List all tracked domains, sorted by id.
async fn list_domains(State(state): State<AppState>) -> ApiResult<Json<DomainListResponse>> {
    let snapshot = state.cache.snapshot();
    let domains: Vec<DomainSummary> = snapshot
        .entries
        .iter()
        .map(|e| DomainSummary::from(e.as_ref()))
        .collect();

    Ok(Json(DomainListResponse {
        connection: snapshot.connection,
        last_enumeration: snapshot.last_enumeration,
        total: domains.len(),
        domains,
    }))
}

/// Get one tracked domain by UUID.
async fn get_domain(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DomainSummary>> {
    let key = uuid::Uuid::parse_str(&id)
        .map(|u| u.hyphenated().to_string())
        .unwrap_or(id);
    state
        .cache
        .get(&key)
        .map(|entry| Json(DomainSummary::from(entry.as_ref())))
        .ok_or_else(|| ApiError::not_found(format!("Domain with id '{}' not found", key)))
}
