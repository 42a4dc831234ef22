use std::sync::Arc;

use anyhow::Context;

use estimator_infra::{EstimationCore, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    estimator_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;

    let jwt_secret = settings.jwt_secret.clone().unwrap_or_else(|| {
        tracing::warn!("JWT_SECRET_KEY not set; using insecure dev default");
        "dev-secret".to_string()
    });
    let port = settings.port;

    let core = Arc::new(EstimationCore::init(settings).context("failed to initialize services")?);
    core.start();

    let app = estimator_api::app::build_app(core.clone(), &jwt_secret);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind 0.0.0.0:{port}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    core.shutdown().await;
    Ok(())
}
