use metrics_exporter_prometheus::PrometheusBuilder;
use pinboard_guard::{clock::SystemClock, config::Config, routes, state::AppState, store::MemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        bind_addr = %config.bind_addr,
        content_max = config.rate_limit.content_max,
        ip_max = config.rate_limit.ip_max,
        cache_ttl_secs = config.cache.default_ttl_secs,
        analyzer_failure_policy = %config.moderation.analyzer_failure_policy,
        "Starting pinboard guard"
    );
    if config.trust_forwarded_for {
        warn!("Trusting X-Forwarded-For; only enable behind a proxy that sets it");
    }

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, Arc::new(MemoryStore::new()), Arc::new(SystemClock::new()))?
        .with_metrics(metrics_handle);
    let background = state.spawn_background_tasks();

    let app = routes::create_router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "Server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    for task in background {
        task.abort();
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
