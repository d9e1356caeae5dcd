//! Prometheus scrape route.

use axum::{Router, extract::State, http::header, response::IntoResponse, routing::get};

use crate::api::server::AppState;
use crate::metrics::CONTENT_TYPE;

/// Create the metrics router.
pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(scrape))
}

/// Render the cache. Never waits on an inspection.
async fn scrape(State(state): State<AppState>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], state.exporter.render())
}
