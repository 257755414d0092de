use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// Prometheus scrape endpoint (text exposition format).
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the pipeline's metrics.
pub fn describe() {
    metrics::describe_counter!("upscale_jobs_submitted_total", "Upscale jobs accepted by the API");
    metrics::describe_counter!("upscale_jobs_completed_total", "Upscale jobs completed");
    metrics::describe_counter!("upscale_jobs_failed_total", "Upscale jobs that failed permanently");
    metrics::describe_counter!("upscale_jobs_retried_total", "Upscale job attempts re-queued for retry");
    metrics::describe_histogram!("upscale_processing_seconds", "Time to process one upscale job");
    metrics::describe_gauge!("upscale_queue_depth", "Pending upscale jobs, including delayed retries");
    metrics::describe_counter!("webhook_deliveries_total", "Webhook delivery outcomes");
    metrics::describe_counter!("rate_limit_rejections_total", "Requests rejected by admission control");
}
