use anyhow::{Context, Result};
use std::sync::Arc;
use storage_tiering::api::{start_api_server, AppState};
use storage_tiering::config::Config;
use storage_tiering::events::BroadcastPublisher;
use storage_tiering::health::HealthRegistry;
use storage_tiering::service::{TieringService, TieringSettings};
use storage_tiering::sweeper::RetrySettings;
use storage_tiering::PgCatalog;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    config.validate().context("Invalid configuration")?;
    let chains = config.chains().context("Invalid tier chains")?;

    info!(
        service = %config.service.name,
        chains = chains.len(),
        cameras = config.cameras.len(),
        "Starting storage tiering service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let catalog = Arc::new(
        PgCatalog::new(&config.database)
            .await
            .context("Failed to initialize recording catalog")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        catalog
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let publisher = Arc::new(BroadcastPublisher::new(config.sweeper.event_channel_capacity));
    let mut events = publisher.subscribe();
    let event_log_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(
                    recording_id = %event.recording_id(),
                    camera_id = %event.camera_id(),
                    from_tier = event.from_tier(),
                    to_tier = ?event.to_tier(),
                    "Tier event"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Tier event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let settings = TieringSettings {
        retry: RetrySettings {
            base_delay: config.sweeper.retry_base_delay(),
            max_delay: config.sweeper.retry_max_delay(),
        },
        orphan_grace: config.sweeper.orphan_grace(),
    };

    let service = Arc::new(TieringService::new(
        chains,
        catalog,
        publisher,
        HealthRegistry::new(config.sweeper.degraded_after_failures),
        settings,
    ));

    if config.sweeper.reconcile_on_startup {
        match service.reconcile().await {
            Ok(report) => info!(
                orphan_rows = report.orphan_rows,
                orphan_files = report.orphan_files,
                adopted = report.adopted,
                "Startup reconciliation finished"
            ),
            Err(e) => error!(error = %e, "Startup reconciliation failed"),
        }
    }

    for camera_id in &config.cameras {
        service.start_camera(camera_id);
    }

    // Spawn API server task
    let api_shutdown = CancellationToken::new();
    let api_handle = if config.api.enabled {
        let api_state = AppState {
            service: service.clone(),
        };
        let api_config = config.api.clone();
        let shutdown = api_shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_api_server(api_state, &api_config, shutdown).await {
                error!(error = %e, "API server error");
            }
        }))
    } else {
        None
    };

    info!("Storage tiering service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down storage tiering service");

    // Shutdown passes run here; the API keeps serving health until they finish
    service.shutdown().await;

    api_shutdown.cancel();
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "API server task panicked");
        }
    }

    drop(service);
    event_log_handle.abort();

    info!("Storage tiering service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
