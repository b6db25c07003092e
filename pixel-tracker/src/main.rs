//! Deduplicate storefront events and dispatch them to every configured ad pixel.
use anyhow::Context;
use envconfig::Envconfig;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use pixel_tracker::config::Config;
use pixel_tracker::server::serve;

async fn shutdown() {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "failed to listen for SIGTERM");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = tokio::signal::ctrl_c() => {},
    };

    tracing::info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let listener = TcpListener::bind(config.bind())
        .await
        .with_context(|| format!("failed to bind {}", config.bind()))?;

    serve(config, listener, shutdown()).await
}
