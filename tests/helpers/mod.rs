//! Test helper utilities for pipeline integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use base64::Engine;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use upscale_pipeline::models::job::{
    ImageSource, JobInput, ModelVariant, NewJob, TransformParams, UpscaleJob,
};
use upscale_pipeline::services::image_source::ImageFetcher;
use upscale_pipeline::services::inference::{
    InferenceError, InferenceOutput, InferenceProvider, InferenceRequest,
};
use upscale_pipeline::services::memory_store::MemoryJobStore;
use upscale_pipeline::services::queue::JobStore;
use upscale_pipeline::services::retry::RetryPolicy;
use upscale_pipeline::services::webhook::{WebhookDispatcher, EVENT_HEADER, SIGNATURE_HEADER};
use upscale_pipeline::services::worker::{PoolConfig, WorkerPool};

pub const WEBHOOK_SECRET: &str = "whsec_integration";
pub const API_KEY_ID: &str = "key_test";
pub const USER_ID: &str = "user_test";

/// Encode a blank RGB image of the given size as PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::new(width, height);
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageFormat::Png)
        .expect("encode png");
    buffer.into_inner()
}

pub fn png_data_uri(width: u32, height: u32) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png_bytes(width, height))
    )
}

pub fn params(source: ImageSource, scale: u8) -> TransformParams {
    TransformParams {
        source,
        scale,
        denoise: false,
        remove_artifacts: false,
    }
}

/// A 4x3 inline PNG upscaled by `scale`.
pub fn upscale_input(scale: u8) -> JobInput {
    JobInput::Upscale(params(ImageSource::Inline(png_data_uri(4, 3)), scale))
}

pub fn new_job(input: JobInput, webhook_url: Option<String>) -> NewJob {
    NewJob {
        api_key_id: API_KEY_ID.to_string(),
        user_id: USER_ID.to_string(),
        input,
        webhook_url,
        priority: 5,
    }
}

/// Poll the store until the job reaches `completed` or `failed`.
pub async fn wait_for_terminal(
    store: &dyn JobStore,
    job_id: Uuid,
    timeout: Duration,
) -> UpscaleJob {
    let deadline = Instant::now() + timeout;
    loop {
        let job = store
            .get(job_id)
            .await
            .expect("store read")
            .expect("job exists");
        if job.status.is_terminal() {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {job_id} still {} after {timeout:?}",
            job.status
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// Scripted result of one inference call.
#[derive(Debug, Clone, Copy)]
pub enum MockOutcome {
    Succeed,
    /// Provider overloaded (503), worth retrying.
    Transient,
    /// Provider rejected the input.
    Permanent,
}

/// In-process inference provider.
///
/// Pops one scripted outcome per call and succeeds once the script is empty.
/// Successful calls return a data URI holding a PNG of the upscaled size.
pub struct MockInference {
    script: Mutex<VecDeque<MockOutcome>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    variants: Mutex<Vec<ModelVariant>>,
}

impl MockInference {
    pub fn succeeding() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(outcomes: Vec<MockOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            variants: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn variants(&self) -> Vec<ModelVariant> {
        self.variants.lock().clone()
    }
}

#[async_trait]
impl InferenceProvider for MockInference {
    async fn run(&self, request: InferenceRequest<'_>) -> Result<InferenceOutput, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.variants.lock().push(request.variant);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let outcome = self.script.lock().pop_front().unwrap_or(MockOutcome::Succeed);
        match outcome {
            MockOutcome::Succeed => {
                let scale = u32::from(request.params.scale);
                Ok(InferenceOutput {
                    artifact: png_data_uri(request.image.width * scale, request.image.height * scale),
                })
            }
            MockOutcome::Transient => Err(InferenceError::Status {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: "overloaded".to_string(),
            }),
            MockOutcome::Permanent => Err(InferenceError::Prediction(
                "unsupported image".to_string(),
            )),
        }
    }
}

/// Webhook request as seen by the receiver.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: String,
    pub signature: String,
    pub body: Bytes,
}

impl Delivery {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("webhook body is json")
    }
}

struct ReceiverState {
    deliveries: Mutex<Vec<Delivery>>,
    responses: Mutex<VecDeque<StatusCode>>,
}

/// Local HTTP endpoint that records webhook deliveries.
///
/// Answers with the scripted statuses in order, then 200.
pub struct WebhookReceiver {
    pub url: String,
    state: Arc<ReceiverState>,
}

impl WebhookReceiver {
    pub async fn spawn(responses: Vec<StatusCode>) -> Self {
        let state = Arc::new(ReceiverState {
            deliveries: Mutex::new(Vec::new()),
            responses: Mutex::new(responses.into()),
        });
        let app = Router::new()
            .route("/hook", post(receive))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind webhook receiver");
        let addr = listener.local_addr().expect("receiver address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("webhook receiver");
        });

        Self {
            url: format!("http://{addr}/hook"),
            state,
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.deliveries.lock().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.deliveries().into_iter().map(|d| d.event).collect()
    }

    /// Wait until at least `count` deliveries have arrived.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Delivery> {
        let deadline = Instant::now() + timeout;
        loop {
            let deliveries = self.deliveries();
            if deliveries.len() >= count {
                return deliveries;
            }
            assert!(
                Instant::now() < deadline,
                "expected {count} webhook deliveries, got {}",
                deliveries.len()
            );
            sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn receive(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    state.deliveries.lock().push(Delivery {
        event: header(EVENT_HEADER),
        signature: header(SIGNATURE_HEADER),
        body,
    });
    state
        .responses
        .lock()
        .pop_front()
        .unwrap_or(StatusCode::OK)
}

/// Webhook dispatcher with a short backoff.
pub fn dispatcher() -> WebhookDispatcher {
    WebhookDispatcher::new(
        WEBHOOK_SECRET,
        Duration::from_secs(5),
        RetryPolicy::new(3, Duration::from_millis(20)),
    )
    .expect("build dispatcher")
}

/// Pool settings that keep test runs short.
pub fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        concurrency: 5,
        jobs_per_second: 1000,
        provider_concurrency: 5,
        poll_interval: Duration::from_millis(10),
        notify_processing: false,
        retry: RetryPolicy::new(3, Duration::from_millis(20)),
    }
}

/// A running worker pool over an in-memory store.
pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub inference: Arc<MockInference>,
    pub pool: Arc<WorkerPool>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Harness {
    pub fn start(inference: MockInference, config: PoolConfig) -> Self {
        let store = Arc::new(MemoryJobStore::default());
        let inference = Arc::new(inference);
        let pool = Arc::new(WorkerPool::new(
            store.clone(),
            inference.clone(),
            ImageFetcher::new(Duration::from_secs(5)).expect("build image fetcher"),
            dispatcher(),
            config,
        ));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&pool).run(shutdown.clone()));

        Self {
            store,
            inference,
            pool,
            shutdown,
            handle,
        }
    }

    pub async fn submit(&self, job: NewJob) -> Uuid {
        self.store.enqueue(job).await.expect("enqueue")
    }

    pub async fn wait_for_terminal(&self, job_id: Uuid) -> UpscaleJob {
        wait_for_terminal(self.store.as_ref(), job_id, Duration::from_secs(10)).await
    }

    /// Stop claiming and wait for in-flight jobs to drain.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.expect("worker pool task");
    }
}
