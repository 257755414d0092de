use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::services::rate_limit::{RateLimitDecision, RateLimiter};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Caller identifier: first forwarded IP, then the real-IP header, else a
/// coarse fingerprint of client headers.
pub fn client_identifier(headers: &HeaderMap) -> String {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

    if let Some(ip) = header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return ip.to_string();
    }
    if let Some(ip) = header("x-real-ip").map(str::trim).filter(|ip| !ip.is_empty()) {
        return ip.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(header("user-agent").unwrap_or_default());
    hasher.update(b"|");
    hasher.update(header("accept-language").unwrap_or_default());
    let digest = hex::encode(hasher.finalize());
    format!("fp:{}", &digest[..16])
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn annotate(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    set_header(headers, LIMIT_HEADER, decision.limit);
    set_header(headers, REMAINING_HEADER, decision.remaining);
    set_header(headers, RESET_HEADER, decision.reset_at.timestamp());
}

/// Admission middleware, installed with `from_fn_with_state(limiter, enforce)`.
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let identifier = client_identifier(request.headers());
    let now = Utc::now();
    let decision = limiter.check_at(&identifier, now);

    if !decision.allowed {
        let retry_after = decision.retry_after_secs(now);
        metrics::counter!("rate_limit_rejections_total", "limiter" => limiter.name()).increment(1);
        tracing::warn!(
            limiter = limiter.name(),
            identifier = %identifier,
            retry_after,
            "Request rejected by rate limiter"
        );

        let body = json!({
            "error": "Too Many Requests",
            "message": format!("Rate limit exceeded, retry in {retry_after} seconds"),
            "retryAfter": retry_after,
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        annotate(response.headers_mut(), &decision);
        set_header(response.headers_mut(), "retry-after", retry_after);
        return response;
    }

    let mut response = next.run(request).await;
    annotate(response.headers_mut(), &decision);
    response
}
