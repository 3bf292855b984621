//! HTTP server for the plugin API, health and metrics

use cni_lib::server::{create_router, AppState};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Serve the daemon API on `addr` until `shutdown` resolves
pub async fn serve(
    addr: &str,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("API server stopped");
    Ok(())
}
