use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::models::job::{ModelVariant, TransformParams};
use crate::services::image_source::NormalizedImage;

/// One call to the inference provider.
pub struct InferenceRequest<'a> {
    pub variant: ModelVariant,
    pub image: &'a NormalizedImage,
    pub params: &'a TransformParams,
}

/// Reference to the transformed artifact: an http(s) URL or a data URI.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub artifact: String,
}

/// External service that performs the actual image transform.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn run(&self, request: InferenceRequest<'_>) -> Result<InferenceOutput, InferenceError>;
}

/// Client for a hosted prediction API (`POST {base}/models/{model}/predictions`).
pub struct HttpInferenceClient {
    http: Client,
    base_url: String,
    api_token: String,
    general_model: String,
    face_model: String,
}

#[derive(Deserialize)]
struct PredictionResponse {
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpInferenceClient {
    pub fn new(
        base_url: &str,
        api_token: &str,
        general_model: &str,
        face_model: &str,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            general_model: general_model.to_string(),
            face_model: face_model.to_string(),
        })
    }

    pub fn model_for(&self, variant: ModelVariant) -> &str {
        match variant {
            ModelVariant::GeneralUpscale => &self.general_model,
            ModelVariant::FaceRestoration => &self.face_model,
        }
    }
}

#[async_trait]
impl InferenceProvider for HttpInferenceClient {
    async fn run(&self, request: InferenceRequest<'_>) -> Result<InferenceOutput, InferenceError> {
        let model = self.model_for(request.variant);
        let url = format!("{}/models/{}/predictions", self.base_url, model);

        let request_body = serde_json::json!({
            "input": {
                "image": request.image.to_data_uri(),
                "scale": request.params.scale,
                "face_enhance": request.variant == ModelVariant::FaceRestoration,
                "denoise": request.params.denoise,
                "remove_artifacts": request.params.remove_artifacts,
            }
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .header("Prefer", "wait")
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status { status, body });
        }

        let prediction: PredictionResponse = response.json().await?;
        artifact_from_prediction(prediction)
    }
}

fn artifact_from_prediction(prediction: PredictionResponse) -> Result<InferenceOutput, InferenceError> {
    match prediction.status.as_str() {
        "failed" | "canceled" => {
            return Err(InferenceError::Prediction(
                prediction
                    .error
                    .unwrap_or_else(|| format!("prediction {}", prediction.status)),
            ))
        }
        "succeeded" => {}
        other => return Err(InferenceError::NotReady(other.to_string())),
    }

    // Output is either a single URL or a list whose first entry is the image.
    let artifact = match prediction.output {
        Some(serde_json::Value::String(url)) => Some(url),
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .find_map(|item| item.as_str().map(str::to_string)),
        _ => None,
    };

    artifact
        .map(|artifact| InferenceOutput { artifact })
        .ok_or(InferenceError::MissingOutput)
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference provider returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Prediction failed: {0}")]
    Prediction(String),

    #[error("Prediction still {0} when the wait window closed")]
    NotReady(String),

    #[error("Prediction succeeded without an output artifact")]
    MissingOutput,
}

impl InferenceError {
    /// Network, 5xx and throttling failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Http(_) | InferenceError::NotReady(_) => true,
            InferenceError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            InferenceError::Prediction(_) | InferenceError::MissingOutput => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prediction(value: serde_json::Value) -> PredictionResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_string_output() {
        let out = artifact_from_prediction(prediction(json!({
            "status": "succeeded",
            "output": "https://cdn.test/out.png"
        })))
        .unwrap();
        assert_eq!(out.artifact, "https://cdn.test/out.png");
    }

    #[test]
    fn test_list_output_takes_first_string() {
        let out = artifact_from_prediction(prediction(json!({
            "status": "succeeded",
            "output": ["https://cdn.test/a.png", "https://cdn.test/b.png"]
        })))
        .unwrap();
        assert_eq!(out.artifact, "https://cdn.test/a.png");
    }

    #[test]
    fn test_failed_prediction_is_permanent() {
        let err = artifact_from_prediction(prediction(json!({
            "status": "failed",
            "error": "CUDA out of memory"
        })))
        .unwrap_err();
        assert!(matches!(err, InferenceError::Prediction(ref msg) if msg == "CUDA out of memory"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_unfinished_prediction_is_transient() {
        let err = artifact_from_prediction(prediction(json!({ "status": "processing" }))).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_status_classification() {
        let server = InferenceError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        let client = InferenceError::Status {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            body: String::new(),
        };
        assert!(server.is_transient());
        assert!(!client.is_transient());
    }

    #[test]
    fn test_model_selection() {
        let client = HttpInferenceClient::new(
            "https://api.test/v1/",
            "token",
            "general/esrgan",
            "faces/gfpgan",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.model_for(ModelVariant::GeneralUpscale), "general/esrgan");
        assert_eq!(client.model_for(ModelVariant::FaceRestoration), "faces/gfpgan");
    }
}
