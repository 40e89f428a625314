use anyhow::{Context, Result};
use std::sync::Arc;
use thumbnailer::{
    init_metrics, AmqpConsumer, Config, ImageThumbsGenerator, LogFormat, MessageConsumer,
    ThumbnailsService,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, config.service.log_format);

    if let Err(e) = dotenv {
        warn!(error = %e, "No .env file loaded, using environment variables directly");
    }

    info!(
        service = %config.service.name,
        originals_root = %config.thumbnails.originals_root.display(),
        thumbnails_root = %config.thumbnails.thumbnails_root.display(),
        widths = ?config.thumbnails.widths_px,
        "Starting thumbnailer service"
    );

    // Initialize metrics
    let metrics = init_metrics(&config.telemetry).context("Failed to initialize metrics")?;

    // Initialize components
    let generator = Arc::new(ImageThumbsGenerator::new(metrics.clone()));
    let thumbnails = Arc::new(ThumbnailsService::new(config.thumbnails.clone(), generator));

    let mut consumer = AmqpConsumer::new(config.amqp.clone(), thumbnails, metrics.clone())
        .context("Failed to create AMQP consumer")?;

    let cancel = CancellationToken::new();
    consumer
        .start(cancel.clone())
        .await
        .context("Failed to start AMQP consumer")?;

    info!("Thumbnailer service is running");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down thumbnailer service");

    cancel.cancel();
    consumer.stop(config.shutdown_grace()).await;

    if let Err(e) = metrics.shutdown(config.telemetry_shutdown_timeout()).await {
        error!(error = %e, "Failed to shutdown telemetry");
    }

    info!("Thumbnailer service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).init(),
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
