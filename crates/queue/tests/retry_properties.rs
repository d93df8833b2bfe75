//! Attempt accounting over arbitrary fail/complete sequences.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;

use jobforge_core::{JobFailure, JobOptions, JobStatus, ManualClock, WorkerId};
use jobforge_events::InMemoryEventBus;
use jobforge_queue::{QueueConfig, QueueEngine};
use jobforge_store::InMemoryJobStore;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Runs the job until it is terminal. `outcomes[i]` says whether attempt
/// `i + 1` succeeds; attempts past the end fail.
async fn drive(max_attempts: u32, outcomes: &[bool]) -> (JobStatus, u32) {
    let clock = Arc::new(ManualClock::default());
    let engine = QueueEngine::new(
        InMemoryJobStore::arc(),
        Arc::new(InMemoryEventBus::new()),
        clock.clone(),
        QueueConfig::default(),
    );
    let id = engine
        .enqueue("q", "x", json!(null), JobOptions::default().with_max_attempts(max_attempts))
        .await
        .unwrap();
    let worker = WorkerId::from("w1");

    loop {
        let job = engine.get_job(id).await.unwrap().unwrap();
        if job.status.is_terminal() {
            return (job.status, job.attempts);
        }
        let Some(claimed) = engine.claim("q", &worker, Duration::from_secs(30)).await.unwrap() else {
            clock.advance(Duration::from_secs(60));
            continue;
        };
        let attempt = claimed.job.attempts as usize;
        if outcomes.get(attempt - 1).copied().unwrap_or(false) {
            engine.complete(id, claimed.token, json!("ok")).await.unwrap();
        } else {
            engine
                .fail(id, claimed.token, JobFailure::execution("no"))
                .await
                .unwrap();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, ..ProptestConfig::default() })]

    #[test]
    fn attempts_never_exceed_the_budget(
        max_attempts in 1u32..6,
        outcomes in proptest::collection::vec(any::<bool>(), 0..6),
    ) {
        let (status, attempts) = runtime().block_on(drive(max_attempts, &outcomes));

        prop_assert!(attempts >= 1 && attempts <= max_attempts);
        let first_success = outcomes
            .iter()
            .take(max_attempts as usize)
            .position(|ok| *ok);
        match first_success {
            Some(i) => {
                prop_assert_eq!(status, JobStatus::Completed);
                prop_assert_eq!(attempts, i as u32 + 1);
            }
            None => {
                prop_assert_eq!(status, JobStatus::Failed);
                prop_assert_eq!(attempts, max_attempts);
            }
        }
    }
}
