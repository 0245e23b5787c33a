//! A single HTTP worker process bound to one port.

use crate::{
    bootstrap, config::AppConfig, routes::routes::build_router, shutdown::shutdown_signal,
    state::AppState,
};
use anyhow::Result;
use std::io::ErrorKind;
use tokio::net::TcpListener;

/// Open this worker's pool, build the router and serve until a shutdown
/// signal arrives. The schema is expected to be migrated already.
pub async fn run(cfg: &AppConfig, port: u16) -> Result<()> {
    let services = bootstrap::open_services(cfg).await?;
    let state = AppState::new(services.storage, services.repository)
        .with_upload_policy(cfg.upload_policy());
    let app = build_router(state, cfg.request_timeout());

    let listener = bind(cfg, port).await?;
    tracing::info!(port, "Worker listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(port, "Worker stopped");
    Ok(())
}

async fn bind(cfg: &AppConfig, port: u16) -> Result<TcpListener> {
    let addr = cfg.addr(port);
    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            Ok(TcpListener::bind(&fallback_addr).await?)
        }
        Err(err) => Err(err.into()),
    }
}
