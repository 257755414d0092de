use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub job_store: StoreHealth,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Pending jobs, including delayed retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u64>,
}

/// GET /health — job store reachability and backlog.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let job_store = match state.store.health_check().await {
        Ok(()) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            let queue_depth = state
                .store
                .queue_depth()
                .await
                .inspect_err(|e| tracing::warn!(error = %e, "Queue depth unavailable"))
                .ok();
            StoreHealth {
                reachable: true,
                latency_ms: Some(latency_ms),
                queue_depth,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Job store health check failed");
            StoreHealth {
                reachable: false,
                latency_ms: None,
                queue_depth: None,
            }
        }
    };

    let (code, status) = if job_store.reachable {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            job_store,
        }),
    )
}
