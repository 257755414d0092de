//! Redis-backed job store integration.
//!
//! Note: This requires a running Redis instance reachable through REDIS_URL.
//! Run with: cargo test --test integration_test -- --ignored

mod helpers;

use std::time::Duration;

use uuid::Uuid;

use helpers::*;
use upscale_pipeline::models::job::{JobStatus, TransformResult};
use upscale_pipeline::services::queue::{JobStore, QueueError, RetentionPolicy};
use upscale_pipeline::services::redis_store::RedisJobStore;

fn redis_store() -> RedisJobStore {
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    // Fresh prefix per test so runs never see each other's keys.
    let prefix = format!("upscale-test-{}", Uuid::new_v4());
    RedisJobStore::new(&redis_url, &prefix, RetentionPolicy::default())
        .expect("Failed to initialize Redis job store")
}

fn result() -> TransformResult {
    TransformResult {
        output_url: "https://cdn.test/out.png".to_string(),
        original_width: 4,
        original_height: 3,
        output_width: 8,
        output_height: 6,
        output_size: None,
        processing_time_ms: 5,
    }
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_job_lifecycle() {
    let store = redis_store();
    store.health_check().await.expect("Redis reachable");

    let job_id = store.enqueue(new_job(upscale_input(2), None)).await.unwrap();
    assert_eq!(store.queue_depth().await.unwrap(), 1);

    let job = store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let claimed = store.claim_next().await.unwrap().expect("job is claimable");
    assert_eq!(claimed.id, job_id);
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.attempts, 1);
    assert!(store.claim_next().await.unwrap().is_none());

    let done = store.complete(job_id, result()).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.completed_at.is_some());

    // Terminal jobs never transition again.
    let err = store.fail(job_id, "late failure".to_string()).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidTransition(_)));
    assert_eq!(store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_priority_order() {
    let store = redis_store();

    let mut low = new_job(upscale_input(2), None);
    low.priority = 8;
    let mut high = new_job(upscale_input(2), None);
    high.priority = 1;
    let first_low = store.enqueue(low.clone()).await.unwrap();
    let second_low = store.enqueue(low).await.unwrap();
    let high_id = store.enqueue(high).await.unwrap();

    let order: Vec<Uuid> = [
        store.claim_next().await.unwrap().unwrap().id,
        store.claim_next().await.unwrap().unwrap().id,
        store.claim_next().await.unwrap().unwrap().id,
    ]
    .into();
    assert_eq!(order, vec![high_id, first_low, second_low]);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_retry_delay() {
    let store = redis_store();
    let job_id = store.enqueue(new_job(upscale_input(2), None)).await.unwrap();
    store.claim_next().await.unwrap().unwrap();

    let requeued = store.retry(job_id, Duration::from_millis(300)).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert!(requeued.error.is_none());
    assert_eq!(store.queue_depth().await.unwrap(), 1);

    assert!(store.claim_next().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(400)).await;

    let again = store.claim_next().await.unwrap().expect("delay elapsed");
    assert_eq!(again.id, job_id);
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_concurrent_claims_are_exclusive() {
    let store = std::sync::Arc::new(redis_store());
    for _ in 0..10 {
        store.enqueue(new_job(upscale_input(2), None)).await.unwrap();
    }

    let claims = futures::future::join_all((0..20).map(|_| {
        let store = store.clone();
        async move { store.claim_next().await.unwrap() }
    }))
    .await;

    let mut ids: Vec<Uuid> = claims.into_iter().flatten().map(|job| job.id).collect();
    assert_eq!(ids.len(), 10);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_expired_lease_is_reclaimed() {
    let store = redis_store().with_lease(Duration::from_millis(200));
    let job_id = store.enqueue(new_job(upscale_input(2), None)).await.unwrap();

    // The first worker claims the job and never reports back.
    let first = store.claim_next().await.unwrap().expect("job is claimable");
    assert_eq!(first.attempts, 1);
    assert!(store.claim_next().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = store.claim_next().await.unwrap().expect("lease expired");
    assert_eq!(second.id, job_id);
    assert_eq!(second.status, JobStatus::Processing);
    assert_eq!(second.attempts, 2);

    // Finalizing releases the lease, so nothing is handed out again.
    store.complete(job_id, result()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.claim_next().await.unwrap().is_none());
    assert_eq!(
        store.get(job_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_redis_live_lease_is_not_reclaimed() {
    let store = redis_store().with_lease(Duration::from_secs(30));
    store.enqueue(new_job(upscale_input(2), None)).await.unwrap();

    store.claim_next().await.unwrap().expect("job is claimable");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.claim_next().await.unwrap().is_none());
}
