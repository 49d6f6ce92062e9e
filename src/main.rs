use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use codebox::config::ServiceConfig;
use codebox::languages::LanguageRegistry;
use codebox::redis_manager;
use codebox::sandbox::Provisioner;
use codebox::scheduler::Scheduler;
use codebox::server::{create_router, AppState};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("codebox=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env().context("Invalid configuration")?;

    // Load language configurations
    let registry = match std::env::var("LANGUAGES_CONFIG") {
        Ok(path) => {
            let registry = LanguageRegistry::load(&path, &config.default_limits)?;
            info!("Loaded language configurations from {}", path);
            registry
        }
        Err(_) => LanguageRegistry::builtin(&config.default_limits)?,
    };
    info!("Languages: {}", registry.languages().join(", "));

    info!("Starting Codebox...");

    // Fail fast if the host cannot provide the configured isolation
    let provisioner = Arc::new(Provisioner::from_config(&config));
    provisioner
        .health_check()
        .await
        .with_context(|| format!("Sandbox backend '{}' is not usable", provisioner.backend_name()))?;
    info!("Sandbox backend '{}' is ready", provisioner.backend_name());

    let bind_addr = config.bind_addr.clone();
    let redis_url = config.redis_url.clone();
    let scheduler = Arc::new(Scheduler::start(config, Arc::new(registry), provisioner));
    let shutdown = CancellationToken::new();

    let intake = redis_url.map(|url| {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = redis_manager::run_intake(&url, scheduler, shutdown).await {
                error!("Redis intake failed: {:#}", e);
            }
        })
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("Listening on {}", bind_addr);

    let app = create_router(AppState::new(scheduler.clone()));
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");

    // Stop intake first so no new work races the drain
    shutdown.cancel();
    if let Some(intake) = intake {
        let _ = intake.await;
    }
    scheduler.shutdown(DRAIN_TIMEOUT).await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }

    info!("Codebox stopped");
    Ok(())
}
