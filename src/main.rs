//! pgdump-s3 binary entry point

use std::sync::Arc;

use pgdump_s3::{config, scheduler::CronScheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics and the optional endpoint
/// 4. Build the backup pipeline
/// 5. Run the scheduler until SIGINT/SIGTERM
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = match config::AppConfig::load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("pgdump-s3: {}", error);
            return Err(error.into());
        }
    };

    // 2. Initialize tracing/logging
    let default_filter = format!(
        "pgdump_s3={level},tower_http={level}",
        level = config.logging.level
    );
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.clone().into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting pgdump-s3...");
    tracing::info!(
        schedule = %config.schedule.cron,
        endpoint = %config.storage.endpoint,
        bucket = %config.storage.bucket,
        prefix = %config.storage.prefix,
        "Configuration loaded"
    );

    // 3. Initialize metrics
    pgdump_s3::metrics::init_metrics();

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let metrics_server = if config.metrics.enabled {
        let metrics_config = config.metrics.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(error) = pgdump_s3::server::serve(&metrics_config, shutdown).await {
                tracing::error!(error = %error, "Metrics endpoint failed");
            }
        }))
    } else {
        None
    };

    // 4. Build the backup pipeline
    let pipeline = Arc::new(pgdump_s3::build_pipeline(&config)?);
    tracing::info!(latest_key = %pipeline.layout().latest_key(), "Backup pipeline ready");

    // 5. Run the scheduler
    let scheduler = CronScheduler::from_config(&config.schedule)?;
    scheduler.run(pipeline, shutdown.clone()).await;

    shutdown.cancel();
    if let Some(handle) = metrics_server {
        let _ = handle.await;
    }

    tracing::info!("pgdump-s3 stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %error, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(error = %error, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });
}
