//! Standalone proxy pool service
//!
//! Runs the pool manager with its background loops until interrupted,
//! then flushes a final snapshot.

use anyhow::Result;
use proxy_pool::ProxyPoolManager;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting proxy pool service");
    let manager = Arc::new(ProxyPoolManager::from_env());

    if manager.settings().use_proxies {
        manager.refresh().await;
    } else {
        warn!("proxies are disabled in configuration, set USE_PROXIES=true to use this service");
    }

    let tasks = Arc::clone(&manager).spawn_background_tasks();

    tokio::signal::ctrl_c().await?;
    info!("proxy pool service shutting down");
    manager.shutdown().await;
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}
