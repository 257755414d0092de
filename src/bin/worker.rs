use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use upscale_pipeline::{
    config::AppConfig,
    routes,
    services::{
        image_source::ImageFetcher,
        inference::HttpInferenceClient,
        queue::JobStore,
        redis_store::RedisJobStore,
        webhook::WebhookDispatcher,
        worker::WorkerPool,
    },
};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting upscale worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus metrics exporter");
    routes::metrics::describe();

    tracing::info!("Initializing services");
    let store: Arc<dyn JobStore> = Arc::new(
        RedisJobStore::new(&config.redis_url, &config.queue_prefix, config.retention())
            .expect("Failed to initialize job store")
            .with_lease(config.job_lease()),
    );

    let inference = HttpInferenceClient::new(
        &config.inference_base_url,
        &config.inference_api_token,
        &config.general_model,
        &config.face_model,
        Duration::from_secs(config.inference_timeout_secs),
    )
    .expect("Failed to initialize inference client");

    let images = ImageFetcher::new(IMAGE_FETCH_TIMEOUT).expect("Failed to initialize image fetcher");

    let webhooks = WebhookDispatcher::new(
        &config.webhook_secret,
        Duration::from_secs(config.webhook_timeout_secs),
        config.webhook_retry(),
    )
    .expect("Failed to initialize webhook dispatcher");

    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&store),
        Arc::new(inference),
        images,
        webhooks,
        config.pool(),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
            }
            shutdown.cancel();
        }
    });
    tokio::spawn(maintenance(Arc::clone(&store), shutdown.clone()));

    tracing::info!("Worker ready, starting job processing loop");
    pool.run(shutdown).await;
}

/// Purge expired terminal jobs and publish the queue depth.
async fn maintenance(store: Arc<dyn JobStore>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match store.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "Purged expired jobs"),
            Err(e) => tracing::warn!(error = %e, "Failed to purge expired jobs"),
        }
        match store.queue_depth().await {
            Ok(depth) => metrics::gauge!("upscale_queue_depth").set(depth as f64),
            Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
        }
    }
}
