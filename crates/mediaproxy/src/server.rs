use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use mediaproxy_service::config::Config;
use mediaproxy_service::coordinator::{FetchCoordinator, run_sweeper};
use mediaproxy_service::metric;

use crate::endpoints;

/// Starts the sweeper and the HTTP server based on loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("mediaproxy-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    runtime.block_on(serve(config))?;
    tracing::info!("System shutdown complete");

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let socket_http = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;

    let coordinator = FetchCoordinator::from_config(&config)
        .await
        .context("failed to create the content cache")?;
    coordinator
        .store()
        .clear_tmp()
        .context("failed to clear temporary files")?;
    let coordinator = Arc::new(coordinator);

    tokio::spawn(run_sweeper(
        Arc::clone(&coordinator),
        config.caches.sweep_interval,
    ));

    let server_http = axum_server::bind(socket_http).serve(
        endpoints::create_app(coordinator).into_make_service_with_connect_info::<SocketAddr>(),
    );
    tracing::info!("Starting HTTP server on {}", socket_http);

    tokio::select! {
        result = server_http => result.context("HTTP server failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
