use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceidd starting");

    let config = config::Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        addr = %config.bind_addr(),
        models = %config.model_dir.display(),
        gallery = %config.gallery_dir.display(),
        algorithm = %config.pipeline.match_algo,
        "configuration loaded"
    );

    // Models and gallery load on this thread so startup fails fast.
    let engine = engine::spawn_engine(&config).context("failed to start recognition engine")?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    tracing::info!(addr = %listener.local_addr()?, "faceidd ready");

    axum::serve(listener, http::router(engine))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("faceidd shutting down");
    Ok(())
}
