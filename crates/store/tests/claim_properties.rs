//! Claim ordering and lease exclusivity against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use serde_json::json;

use jobforge_core::clock::after;
use jobforge_core::{Job, JobOptions, JobStatus, WorkerId};
use jobforge_store::{InMemoryJobStore, JobStore};

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_job() {
    let store = InMemoryJobStore::arc();
    for i in 0..200u64 {
        let job = Job::new(
            "default",
            "work",
            json!({ "n": i }),
            &JobOptions::default(),
            after(t0(), Duration::from_millis(i)),
        )
        .unwrap();
        store.insert(&job).await.unwrap();
    }

    let now = after(t0(), Duration::from_secs(1));
    let mut handles = Vec::new();
    for w in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let worker = WorkerId::new(format!("w{w}"));
            let mut claimed = Vec::new();
            while let Some((job, token)) = store
                .claim_next("default", &worker, Duration::from_secs(30), now)
                .await
                .unwrap()
            {
                claimed.push((job.id, token));
            }
            claimed
        }));
    }

    let mut ids = HashSet::new();
    let mut tokens = HashSet::new();
    for handle in handles {
        for (id, token) in handle.await.unwrap() {
            assert!(ids.insert(id), "job {id} claimed twice");
            assert!(tokens.insert(token));
        }
    }
    assert_eq!(ids.len(), 200);

    let counts = store.count_by_status("default").await.unwrap();
    assert_eq!(counts.active, 200);
    assert_eq!(counts.waiting, 0);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        ..ProptestConfig::default()
    })]

    /// Property: claims come out sorted by (priority, created_at).
    #[test]
    fn claims_follow_priority_then_age(priorities in prop::collection::vec(-5i32..5, 1..30)) {
        let rt = runtime();
        let store = InMemoryJobStore::new();

        let mut expected = Vec::new();
        for (i, priority) in priorities.iter().enumerate() {
            let created = after(t0(), Duration::from_millis(i as u64));
            let job = Job::new(
                "q",
                "work",
                json!(null),
                &JobOptions::default().with_priority(*priority),
                created,
            )
            .unwrap();
            expected.push((*priority, created, job.id));
            rt.block_on(store.insert(&job)).unwrap();
        }
        expected.sort();

        let now = after(t0(), Duration::from_secs(1));
        let worker = WorkerId::from("w");
        let mut claimed = Vec::new();
        while let Some((job, _)) = rt
            .block_on(store.claim_next("q", &worker, Duration::from_secs(30), now))
            .unwrap()
        {
            claimed.push((job.priority, job.created_at, job.id));
        }

        prop_assert_eq!(claimed, expected);
    }

    /// Property: an active job always has exactly one lease and nothing else
    /// can be claimed for it until it is released.
    #[test]
    fn active_jobs_hold_exactly_one_lease(workers in 1usize..6) {
        let rt = runtime();
        let store = InMemoryJobStore::new();
        let job = Job::new("q", "work", json!(null), &JobOptions::default(), t0()).unwrap();
        rt.block_on(store.insert(&job)).unwrap();

        let mut winners = 0;
        for w in 0..workers {
            let worker = WorkerId::new(format!("w{w}"));
            if rt
                .block_on(store.claim_next("q", &worker, Duration::from_secs(30), t0()))
                .unwrap()
                .is_some()
            {
                winners += 1;
            }
        }

        let stored = rt.block_on(store.find_by_id(job.id)).unwrap().unwrap();
        prop_assert_eq!(winners, 1);
        prop_assert_eq!(stored.status, JobStatus::Active);
        prop_assert!(stored.lease.is_some());
    }
}
