//! Cash Closing Daemon
//!
//! Runs the closing engine with its sweep scheduler and notification
//! dispatcher until Ctrl-C.

use anyhow::Context;
use closing_core::{ClosingEngine, Config};
use notification_bus::{
    ChannelSink, Dispatcher, DispatcherConfig, HttpTransport, NoopSink, NotificationSink,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("CLOSING_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::from_env().context("loading config from environment")?,
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.default_directive));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(
        service = %config.service_name,
        version = %config.service_version,
        "Cash closing daemon starting"
    );

    // Notification sink
    let (sink, dispatcher) = match &config.notification.endpoint {
        Some(endpoint) => {
            let (sink, receiver) = ChannelSink::new(config.notification.channel_capacity);
            let transport = HttpTransport::new(
                endpoint.clone(),
                Duration::from_millis(config.notification.timeout_ms),
            )?;
            let dispatcher = Dispatcher::new(
                receiver,
                Arc::new(transport),
                DispatcherConfig {
                    max_retry_attempts: config.notification.max_retry_attempts,
                    ..Default::default()
                },
            );
            info!(endpoint = %endpoint, "Notifications enabled");
            let sink: Arc<dyn NotificationSink> = Arc::new(sink);
            (sink, Some(dispatcher.spawn()))
        }
        None => {
            info!("No notification endpoint configured, notifications discarded");
            let sink: Arc<dyn NotificationSink> = Arc::new(NoopSink);
            (sink, None)
        }
    };

    let engine = ClosingEngine::new(config, sink)
        .await
        .context("starting closing engine")?;
    let scheduler = engine.scheduler().start();

    info!("Cash closing daemon running");

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler.shutdown().await;
    engine.shutdown().await?;

    // Senders are gone once the engine is dropped; let the dispatcher drain
    if let Some(handle) = dispatcher {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Notification dispatcher did not drain in time");
        }
    }

    info!("Cash closing daemon stopped");
    Ok(())
}
