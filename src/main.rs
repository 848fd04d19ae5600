//! Relay Pool - Entry Point
//!
//! Loads the pool, keeps it fresh in the background and reports a working relay.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_pool::config::LogConfig;
use relay_pool::services::{PoolRefresher, RefreshConfig, RefresherHandle};
use relay_pool::{Config, ProxyManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.log);

    info!("Starting relay pool");

    let manager = Arc::new(ProxyManager::from_config(&config).context("Failed to build proxy manager")?);
    if let Err(e) = manager.initialize().await {
        warn!("Pool initialization incomplete: {}", e);
    }

    // Start refresher
    let (refresh_handle, refresh_shutdown) = RefresherHandle::new();
    let refresher = PoolRefresher::new(
        manager.clone(),
        RefreshConfig {
            interval: config.pool.refresh_interval,
            ..RefreshConfig::default()
        },
    );
    let refresh_task = tokio::spawn(async move {
        refresher.run(refresh_shutdown).await;
    });

    let region = config.pool.region.as_deref();
    match manager
        .get_working_proxy(region, config.pool.max_retries)
        .await
    {
        Some(_) => {
            if let Some(mut proxy) = manager.get_proxy_config() {
                if proxy.password.is_some() {
                    proxy.password = Some("***".to_string());
                }
                let proxy = serde_json::to_string(&proxy).context("Failed to encode proxy config")?;
                info!(config = %proxy, "Working relay ready");
            }
        }
        None => warn!(region = ?region, "No working relay available"),
    }

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    refresh_handle.shutdown();
    if let Err(e) = refresh_task.await {
        error!("Refresher task failed: {}", e);
    }
    manager.shutdown().await;

    info!("Relay pool stopped");
    Ok(())
}

/// RUST_LOG wins over LOG_LEVEL
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("relay_pool={}", log.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
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
}
