use anyhow::{Context, Result};

use session_pulse::{SessionMonitor, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout stays free for an embedding protocol layer
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load().context("Failed to load configuration")?;
    tracing::debug!(
        sessions_root = %settings.sessions_root.display(),
        signature = %settings.process_signature,
        "configuration loaded"
    );

    let monitor = SessionMonitor::from_settings(&settings);
    if !monitor.start_monitoring().await {
        tracing::warn!("running without session monitoring until interrupted");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    monitor.stop_monitoring().await;
    Ok(())
}
