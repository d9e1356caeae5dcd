//! Service container for dependency injection.
//!
//! The ServiceContainer builds every exporter component from the resolved
//! configuration and manages their lifecycle: the scheduler stops first,
//! cancelling in-flight inspections and tearing down their sandboxes, and
//! only then does the HTTP server stop answering scrapes.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::api::{ApiServer, ApiServerConfig, AppState};
use crate::config::ExporterConfig;
use crate::error::Error;
use crate::hypervisor::{DomainMetadataManager, Hypervisor, VirshHypervisor};
use crate::inspector::{GuestfishProvider, InspectionWorker, SandboxProvider};
use crate::metrics::{ExporterStats, HealthChecker, MetricsCache};
use crate::scheduler::{InspectionScheduler, SchedulerConfig};

/// Service container holding all exporter components.
pub struct ServiceContainer {
    /// Latest measurements, shared with the HTTP layer.
    pub cache: Arc<MetricsCache>,
    /// Scheduler self-metrics.
    pub stats: Arc<ExporterStats>,
    pub health_checker: Arc<HealthChecker>,
    scheduler: InspectionScheduler,
    server: ApiServer,
    /// Root token: cancels the scheduler and background tasks.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build the container with the virsh and guestfish backends.
    pub fn new(config: &ExporterConfig) -> Result<Self> {
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(VirshHypervisor::new(
            config.virsh_bin.clone(),
            config.libvirt_uri.clone(),
        ));
        let provider: Arc<dyn SandboxProvider> = Arc::new(GuestfishProvider::new(
            config.guestfish_bin.clone(),
            config.scratch_dir.clone(),
        ));
        Self::with_backends(config, hypervisor, provider)
    }

    /// Build the container over custom hypervisor and sandbox backends.
    pub fn with_backends(
        config: &ExporterConfig,
        hypervisor: Arc<dyn Hypervisor>,
        provider: Arc<dyn SandboxProvider>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Initializing service container");

        let cache = Arc::new(MetricsCache::new());
        let stats = Arc::new(ExporterStats::new());
        let cancellation_token = CancellationToken::new();

        let scheduler_config = SchedulerConfig {
            startup_delay: config.startup_delay(),
            ..SchedulerConfig::from(config)
        };
        let worker = InspectionWorker::new(provider, config.inspection_timeout());
        let scheduler = InspectionScheduler::new(
            scheduler_config,
            DomainMetadataManager::new(hypervisor),
            worker,
            Arc::clone(&cache),
            Arc::clone(&stats),
            cancellation_token.child_token(),
        );

        let health_checker = Arc::new(HealthChecker::for_exporter(
            Arc::clone(&cache),
            Arc::clone(&stats),
        ));
        let state = AppState::new(Arc::clone(&cache), Arc::clone(&stats))
            .with_health_checker(Arc::clone(&health_checker));
        // Independent token: the server outlives the scheduler during shutdown.
        let server = ApiServer::with_state(ApiServerConfig::from(config), state);

        info!("Service container initialized");

        Ok(Self {
            cache,
            stats,
            health_checker,
            scheduler,
            server,
            cancellation_token,
        })
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Run the scheduler and the HTTP server until the root token is
    /// cancelled or the server fails.
    pub async fn run(self) -> Result<()> {
        let Self {
            mut scheduler,
            server,
            cancellation_token,
            ..
        } = self;

        let server_token = server.cancel_token();
        let mut server_task = tokio::spawn(async move { server.run().await });
        let mut scheduler_task = tokio::spawn(async move { scheduler.run().await });

        let scheduler_result = tokio::select! {
            result = &mut scheduler_task => result,
            result = &mut server_task => {
                // The server only returns on its own when it failed.
                cancellation_token.cancel();
                if let Err(e) = (&mut scheduler_task).await {
                    error!("Scheduler task failed: {}", e);
                }
                return flatten(result);
            }
        };

        info!("Scheduler stopped, shutting down metrics server");
        server_token.cancel();
        let server_result = flatten(server_task.await);

        if let Err(e) = flatten(scheduler_result) {
            warn!("Scheduler exited with error: {}", e);
            return Err(e);
        }
        server_result
    }
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| Error::Other(format!("Task failed: {}", e)))?
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
