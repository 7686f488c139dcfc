mod common;

use common::Harness;
use payretry::config::RetrySettings;
use payretry::domain::transaction::{Transaction, TransactionStatus};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

async fn scheduled_batch(h: &Harness, count: usize) -> Vec<Transaction> {
    let mut batch = Vec::with_capacity(count);
    for _ in 0..count {
        let tx = h.submit(Some(RetrySettings::default())).await;
        h.decline(&tx, "NETWORK_ERROR").await.unwrap();
        batch.push(tx);
    }
    batch
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_passes_dispatch_each_transaction_once() {
    let h = Arc::new(Harness::new());
    let batch = scheduled_batch(&h, 25).await;
    let now = h.clock.advance(chrono::TimeDelta::seconds(60));

    let passes: Vec<_> = (0..4)
        .map(|_| {
            let h = h.clone();
            tokio::spawn(async move { h.engine.scheduler().run_once(now).await.unwrap() })
        })
        .collect();
    let mut dispatched = 0;
    for pass in passes {
        dispatched += pass.await.unwrap().dispatched;
    }
    h.engine.drain().await;

    assert!(dispatched >= batch.len());
    for tx in &batch {
        assert_eq!(h.gateway.submissions_for(tx.id), 2, "initial attempt plus one retry");
        assert_eq!(h.policy(tx.id).await.current_attempts, 1);
        assert_eq!(h.reload(tx.id).await.status, TransactionStatus::RetryInProgress);
    }
    assert_eq!(h.engine.scheduler().active_dispatches(), 0);
    assert!(h.engine.scheduler().in_flight().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_gateway_does_not_cause_duplicate_dispatch() {
    let h = Harness::new();
    let batch = scheduled_batch(&h, 5).await;
    let gate = h.gateway.hold_submissions();

    let now = h.clock.advance(chrono::TimeDelta::seconds(60));
    let first = h.engine.scheduler().run_once(now).await.unwrap();
    assert_eq!(first.dispatched, 5);

    // The scheduler pass returns while every gateway call is still blocked.
    while h.gateway.in_progress() < 5 {
        tokio::task::yield_now().await;
    }
    let second = h.engine.scheduler().run_once(now).await.unwrap();
    assert_eq!(second.dispatched, 0);

    drop(gate);
    h.gateway.release_submissions();
    h.engine.drain().await;

    for tx in &batch {
        assert_eq!(h.gateway.peak_overlap(tx.id), 1);
        assert_eq!(h.gateway.submissions_for(tx.id), 2);
    }
}

#[tokio::test]
async fn test_attempts_never_exceed_budget() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..20 {
        let h = Harness::new();
        let max_attempts = rng.gen_range(1..=5);
        let tx = h
            .submit(Some(RetrySettings {
                max_attempts: Some(max_attempts),
                ..RetrySettings::default()
            }))
            .await;

        for _ in 0..30 {
            let current = h.reload(tx.id).await;
            if current.has_attempt_in_flight() {
                if rng.gen_bool(0.15) {
                    h.succeed(&tx).await.unwrap();
                } else {
                    let codes = ["NETWORK_ERROR", "GATEWAY_TIMEOUT", "INSUFFICIENT_FUNDS"];
                    let code = codes[rng.gen_range(0..codes.len())];
                    h.decline(&tx, code).await.unwrap();
                }
            } else if current.status == TransactionStatus::Failed && rng.gen_bool(0.3) {
                let _ = h.engine.request_manual_retry(tx.id).await;
            }
            h.advance_and_run(rng.gen_range(1..=600)).await;

            let policy = h.policy(tx.id).await;
            assert!(policy.current_attempts <= policy.max_attempts);
            assert_eq!(h.gateway.submissions_for(tx.id) as u32, policy.current_attempts + 1);
            let status = h.reload(tx.id).await.status;
            if policy.next_retry_at.is_some() {
                assert!(status.is_schedulable(), "armed policy on {} transaction", status);
            }
        }
    }
}
