//! OpenStack CNI daemon
//!
//! Runs on every node, answers the plugin's CNI commands by creating and
//! attaching Neutron ports to the node's server, and reaps ports left
//! behind by containers that are gone.

use anyhow::{Context, Result};
use cni_lib::{
    health::CloudCheck,
    openstack::{CachedClient, CloudClient, OpenStackClient, PortManager},
    server::{AppState, CniCommandHandler, PortCounter, PortReaper},
    state::FileStateStore,
    util::resolve_hostname,
    HealthChecker, Metrics, StructuredLogger,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Drop expired cache entries until shutdown
async fn run_cache_janitor(
    cache: Arc<CachedClient>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = cache.evict_expired();
                if evicted > 0 {
                    debug!(evicted, remaining = cache.len(), "Evicted expired cache entries");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::DaemonConfig::load()?;

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(fmt::layer().json())
        .init();

    info!("Starting openstack-cni-daemon");

    let os_config = config::load_openstack()?;
    let hostname = resolve_hostname(os_config.vm_name.as_deref())
        .context("failed to resolve node hostname")?;
    let listen_addr = config.listen_addr()?;
    info!(hostname = %hostname, listen_addr = %listen_addr, "Daemon configured");

    let client = OpenStackClient::new(os_config, config.cloud_timeout())
        .context("failed to create OpenStack client")?;
    let cache = Arc::new(CachedClient::new(Arc::new(client), config.cache_ttl()));
    let cloud: Arc<dyn CloudClient> = cache.clone();

    let metrics = Metrics::new();
    let logger = StructuredLogger::new(&hostname);

    let state_store = FileStateStore::new(&config.state_dir);
    let handler = CniCommandHandler::new(
        PortManager::new(cloud.clone()),
        hostname.clone(),
        config.port_defaults(),
    )
    .with_state_store(state_store.clone());
    let app_state = Arc::new(AppState {
        handler: Arc::new(handler),
        health: HealthChecker::new().with_check(CloudCheck::new(cloud.clone())),
        metrics: metrics.clone(),
        port_counter: Some(Arc::new(PortCounter::new(cloud.clone(), hostname.clone()))),
        state_store,
        request_timeout: config.request_timeout(),
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    if config.skip_reaping {
        info!("Port reaping disabled");
    } else {
        let reaper = PortReaper::new(cloud.clone(), hostname.clone(), config.reaper(), metrics.clone());
        tokio::spawn(reaper.run(shutdown_tx.subscribe()));
    }
    tokio::spawn(run_cache_janitor(
        cache.clone(),
        config.cache_ttl(),
        shutdown_tx.subscribe(),
    ));

    logger.log_startup(DAEMON_VERSION, &listen_addr);

    let mut server_shutdown = shutdown_tx.subscribe();
    let mut server = tokio::spawn({
        let listen_addr = listen_addr.clone();
        async move {
            api::serve(&listen_addr, app_state, async move {
                let _ = server_shutdown.recv().await;
            })
            .await
        }
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            logger.log_shutdown("SIGINT received");
        }
        result = &mut server => {
            let reason = match &result {
                Ok(Ok(())) => "API server exited".to_string(),
                Ok(Err(e)) => format!("API server failed: {}", e),
                Err(e) => format!("API server task panicked: {}", e),
            };
            error!(reason = %reason, "Shutting down");
            logger.log_shutdown(&reason);
            let _ = shutdown_tx.send(());
            return result.context("API server task panicked")?;
        }
    }

    let _ = shutdown_tx.send(());
    server.await.context("API server task panicked")??;
    info!("Shutdown complete");

    Ok(())
}
