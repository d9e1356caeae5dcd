//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::Request;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, MakeSpan, TraceLayer,
};
use tracing::Level;

use crate::api::routes;
use crate::config::ExporterConfig;
use crate::error::{Error, Result};
use crate::metrics::{ExporterStats, HealthChecker, MetricsCache, PrometheusExporter};

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self::from(&ExporterConfig::default())
    }
}

impl From<&ExporterConfig> for ApiServerConfig {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            bind_address: config.addr.clone(),
            port: config.port,
            enable_cors: config.enable_cors,
        }
    }
}

/// Paths whose requests are too frequent to trace at info level.
fn is_polled_path(path: &str) -> bool {
    path == "/metrics" || path.starts_with("/health")
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub cache: Arc<MetricsCache>,
    pub stats: Arc<ExporterStats>,
    pub exporter: Arc<PrometheusExporter>,
    /// Health checker for real health status
    pub health_checker: Option<Arc<HealthChecker>>,
}

impl AppState {
    /// Create application state over a cache, without health checks.
    pub fn new(cache: Arc<MetricsCache>, stats: Arc<ExporterStats>) -> Self {
        let exporter = Arc::new(PrometheusExporter::new(
            Arc::clone(&cache),
            Arc::clone(&stats),
        ));
        Self {
            start_time: Instant::now(),
            cache,
            stats,
            exporter,
            health_checker: None,
        }
    }

    /// Set the health checker.
    pub fn with_health_checker(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health_checker = Some(checker);
        self
    }
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    /// Create with custom state.
    pub fn with_state(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Stop the server when `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        let mut router = routes::create_router(self.state.clone());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        // Scrapes and health checks arrive every few seconds; keep their spans at debug.
        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let level = if is_polled_path(req.uri().path()) {
                        Level::DEBUG
                    } else {
                        Level::INFO
                    };
                    DefaultMakeSpan::new().level(level).make_span(req)
                })
                .on_response(DefaultOnResponse::new().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        )
    }

    /// Bind the listener and serve until cancelled.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid listen address: {}", e)))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("Metrics server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("Metrics server shutting down...");
            })
            .await
            .map_err(|e| Error::Other(format!("Server error: {}", e)))?;

        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
