//! Postgres contract tests.
//!
//! Ignored by default; run with a scratch database:
//! `DATABASE_URL=postgres://... cargo test -p jobforge-store -- --ignored`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use jobforge_core::clock::after;
use jobforge_core::{Job, JobOptions, JobStatus, LockToken, QueueError, WorkerId};
use jobforge_store::{JobStore, PostgresJobStore};

async fn store() -> PostgresJobStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    PostgresJobStore::connect(&url).await.unwrap()
}

/// Each test uses its own queue name so runs don't interfere.
fn unique_queue(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::now_v7())
}

#[tokio::test]
#[ignore]
async fn insert_and_find_round_trip() {
    let store = store().await;
    let queue = unique_queue("roundtrip");
    let job = Job::new(&queue, "email", json!({"to": "a@b"}), &JobOptions::default(), Utc::now())
        .unwrap();

    store.insert(&job).await.unwrap();
    let found = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(found.id, job.id);
    assert_eq!(found.payload, job.payload);
    assert_eq!(found.status, JobStatus::Waiting);

    let err = store.insert(&job).await.unwrap_err();
    assert_eq!(err, QueueError::DuplicateId(job.id));
}

#[tokio::test]
#[ignore]
async fn stale_token_is_rejected_without_mutation() {
    let store = store().await;
    let queue = unique_queue("stale");
    let now = Utc::now();
    let job = Job::new(&queue, "x", json!(null), &JobOptions::default(), now).unwrap();
    store.insert(&job).await.unwrap();

    let (mut claimed, token) = store
        .claim_next(&queue, &WorkerId::from("w1"), Duration::from_secs(30), now)
        .await
        .unwrap()
        .unwrap();
    let before = store.find_by_id(job.id).await.unwrap();

    claimed.complete(json!("done"), now).unwrap();
    let err = store.save_with_lock(&claimed, LockToken::new()).await.unwrap_err();
    assert_eq!(err, QueueError::LockMismatch(job.id));
    assert_eq!(store.find_by_id(job.id).await.unwrap(), before);

    store.save_with_lock(&claimed, token).await.unwrap();
    let after_save = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(after_save.status, JobStatus::Completed);
}

#[tokio::test]
#[ignore]
async fn concurrent_claims_are_exclusive() {
    let store = Arc::new(store().await);
    let queue = unique_queue("concurrent");
    let now = Utc::now();
    for i in 0..50u64 {
        let job = Job::new(
            &queue,
            "x",
            json!(i),
            &JobOptions::default(),
            after(now, Duration::from_millis(i)),
        )
        .unwrap();
        store.insert(&job).await.unwrap();
    }

    let claim_at = after(now, Duration::from_secs(1));
    let mut handles = Vec::new();
    for w in 0..5 {
        let store = Arc::clone(&store);
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let worker = WorkerId::new(format!("w{w}"));
            let mut ids = Vec::new();
            while let Some((job, _)) = store
                .claim_next(&queue, &worker, Duration::from_secs(30), claim_at)
                .await
                .unwrap()
            {
                ids.push(job.id);
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id));
        }
    }
    assert_eq!(seen.len(), 50);
}
