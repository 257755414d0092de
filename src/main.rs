use std::sync::Arc;
use std::time::Duration;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use upscale_pipeline::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{rate_limit::RateLimiters, redis_store::RedisJobStore},
};

const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing upscale-pipeline API server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe();

    tracing::info!(prefix = %config.queue_prefix, "Connecting to Redis job store");
    let store = RedisJobStore::new(&config.redis_url, &config.queue_prefix, config.retention())
        .expect("Failed to initialize job store");

    let state = AppState::new(Arc::new(store), RateLimiters::default());
    Arc::clone(&state.limiters).spawn_sweeper(LIMITER_SWEEP_INTERVAL);
    let analytics = state.limiters.analytics.clone();

    let app = routes::api_router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics)
                .with_state(prometheus_handle)
                .layer(from_fn_with_state(analytics, routes::rate_limit::enforce)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
