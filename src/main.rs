mod cache;
mod config;
mod download;
mod error;
mod evaluate;
mod page;
mod protocol;
mod runner;
mod server;
mod workspace;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cache::ArtifactCache;
use crate::config::Config;
use crate::download::ReleaseFetcher;
use crate::evaluate::Evaluator;
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // .env feeds the env fallbacks of the flags below
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("playground=info".parse()?),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    info!("Starting bpftrace playground...");

    let fetcher = Arc::new(
        ReleaseFetcher::new(&config.release_url).context("Failed to create release fetcher")?,
    );
    let cache = ArtifactCache::new(&config.cache_dir, config.max_cache, fetcher)
        .await
        .context("Failed to initialize artifact cache")?;
    info!(
        "Artifact cache at {:?} (max {} entries)",
        config.cache_dir, config.max_cache
    );

    if !config.network_isolation {
        warn!("Network isolation is disabled; executions share the host network");
    }

    let evaluator = Evaluator::new(
        Arc::new(cache),
        config.max_timeout_ms,
        config.network_isolation,
    );
    let state = AppState::new(Arc::new(evaluator), config.max_concurrent);
    info!(
        "Max timeout {}ms, {} concurrent execution(s)",
        config.max_timeout_ms, config.max_concurrent
    );

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("Failed to listen on port {}", config.port))?;
    info!("Listening on port {}", config.port);

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server failed")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
