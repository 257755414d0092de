use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::{redirect, Client, StatusCode};
use sha2::Sha256;
use tokio::time::sleep;

use crate::models::webhook::WebhookPayload;
use crate::services::retry::RetryPolicy;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// Compute the hex HMAC-SHA256 of `body` keyed by `secret`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature against `body`.
pub fn verify(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Best-effort delivery of signed job notifications.
///
/// 4xx (and 3xx) responses end delivery immediately. Network errors and 5xx
/// responses are retried with exponential backoff until the attempt budget
/// runs out. The outcome never feeds back into job state.
pub struct WebhookDispatcher {
    http: Client,
    secret: Vec<u8>,
    policy: RetryPolicy,
}

impl WebhookDispatcher {
    pub fn new(secret: &str, timeout: Duration, policy: RetryPolicy) -> Result<Self, WebhookError> {
        let http = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .user_agent(concat!("upscale-pipeline-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            secret: secret.as_bytes().to_vec(),
            policy,
        })
    }

    pub fn sign(&self, body: &[u8]) -> String {
        sign(&self.secret, body)
    }

    pub fn verify(&self, body: &[u8], signature: &str) -> bool {
        verify(&self.secret, body, signature)
    }

    /// Deliver with the configured attempt budget.
    pub async fn send(&self, url: &str, payload: &WebhookPayload) -> bool {
        self.send_with_retries(url, payload, self.policy.max_attempts)
            .await
    }

    /// Deliver `payload` to `url`, trying at most `retries` times.
    pub async fn send_with_retries(&self, url: &str, payload: &WebhookPayload, retries: u32) -> bool {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(job_id = %payload.job_id, error = %e, "Failed to serialize webhook payload");
                return false;
            }
        };
        let signature = self.sign(&body);
        let event = payload.event.as_str();
        let attempts = retries.max(1);

        for attempt in 1..=attempts {
            match self.deliver(url, event, &body, &signature).await {
                Ok(()) => {
                    metrics::counter!("webhook_deliveries_total", "outcome" => "delivered").increment(1);
                    tracing::info!(job_id = %payload.job_id, event, attempt, "Webhook delivered");
                    return true;
                }
                Err(e) if !e.is_retryable() => {
                    metrics::counter!("webhook_deliveries_total", "outcome" => "rejected").increment(1);
                    tracing::warn!(job_id = %payload.job_id, event, attempt, error = %e, "Webhook rejected, not retrying");
                    return false;
                }
                Err(e) => {
                    tracing::warn!(job_id = %payload.job_id, event, attempt, error = %e, "Webhook delivery failed");
                    if attempt < attempts {
                        sleep(self.policy.delay_after(attempt)).await;
                    }
                }
            }
        }

        metrics::counter!("webhook_deliveries_total", "outcome" => "exhausted").increment(1);
        tracing::error!(job_id = %payload.job_id, event, attempts, "Webhook delivery gave up");
        false
    }

    async fn deliver(
        &self,
        url: &str,
        event: &str,
        body: &[u8],
        signature: &str,
    ) -> Result<(), WebhookError> {
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, event)
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebhookError::Status(status))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Receiver returned HTTP {0}")]
    Status(StatusCode),
}

impl WebhookError {
    pub fn is_retryable(&self) -> bool {
        match self {
            WebhookError::Http(_) => true,
            WebhookError::Status(status) => status.is_server_error(),
        }
    }
}
