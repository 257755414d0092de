pub mod health;
pub mod jobs;
pub mod metrics;
pub mod rate_limit;

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

use crate::app_state::AppState;

/// Largest accepted request body. Inline images are capped at 10 MiB of
/// base64 text, and the rest of the JSON document rides on top.
pub const BODY_LIMIT_BYTES: usize = 14 * 1024 * 1024;

/// API routes, each guarded by the limiter for its route class.
///
/// `limiters.auth` has no route here: credentials are checked by the
/// upstream auth layer, which shares the bundle through `AppState`.
pub fn api_router(state: AppState) -> Router {
    let limiters = state.limiters.clone();

    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/jobs",
            post(jobs::submit_job).layer(from_fn_with_state(
                limiters.processing.clone(),
                rate_limit::enforce,
            )),
        )
        .route(
            "/api/v1/jobs/{job_id}",
            get(jobs::get_job_status).layer(from_fn_with_state(
                limiters.api.clone(),
                rate_limit::enforce,
            )),
        )
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .with_state(state)
}
