//! Drop service process.
//!
//! Loads configuration, connects `PostgreSQL` and Redis, starts the reaper,
//! the session sweeper and the sync relay, and stops them on Ctrl+C.

use anyhow::Context;
use drops::{Config, DropApp};
use flashdrop_runtime::metrics::MetricsServer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine; the process environment wins anyway.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drops=info,drop_server=info,flashdrop_runtime=info,flashdrop_postgres=info,flashdrop_redis=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting drop server");

    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(
        redis_url = %config.redis.url,
        catalog_url = %config.collaborators.catalog_url,
        orders_url = %config.collaborators.orders_url,
        reservation_ttl_secs = config.reservations.default_ttl.as_secs(),
        "Configuration loaded"
    );

    let mut metrics_server = MetricsServer::new(config.metrics_addr()?);
    metrics_server.start().context("starting metrics endpoint")?;
    drops::metrics::register_business_metrics();

    let app = DropApp::connect(config).await.context("connecting backends")?;
    let report = app.health().await;
    tracing::info!(status = %report.status, "Initial health check");

    let tasks = app.start();
    tracing::info!("Drop server running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    tracing::info!("Shutdown signal received");

    tasks.shutdown(app.config().server.shutdown_timeout).await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}
