use anyhow::{Context, Result};
use faceverify_core::OnnxVerifier;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod engine;
mod middleware;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        bind = %config.bind,
        model_dir = %config.model_dir.display(),
        default_model = %config.default_model,
        queue_depth = config.queue_depth,
        "faceverifyd starting"
    );

    let mut verifier = OnnxVerifier::new(&config.model_dir);
    if config.preload {
        verifier
            .preload(&[config.default_model])
            .context("failed to preload face models")?;
        tracing::info!(model = %config.default_model, "models preloaded");
    }

    let engine = engine::spawn_engine(verifier, config.queue_depth)?;
    let app = api::router(api::AppState { engine }, &config)
        .context("FACEVERIFY_CORS_ORIGIN is not a valid header value")?;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "faceverifyd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("faceverifyd shutting down");
        })
        .await?;

    Ok(())
}
