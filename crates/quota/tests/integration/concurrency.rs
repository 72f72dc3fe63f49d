//! Concurrency tests for quota enforcement
//!
//! Many tasks hammer the same user at once on a multi-threaded runtime. No
//! interleaving may allow more consumption than the limit, and the gauge
//! must end exactly where the sequence of successful operations puts it.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use proptest::prelude::*;
use quotaguard_quota::{
    InMemoryStore, LedgerOperation, LedgerOutcome, ManualClock, QuotaConfig, QuotaService,
    SubscriptionStore,
};
use quotaguard_shared::{Feature, Tier, UserId};
use time::macros::datetime;
use time::OffsetDateTime;

const START: OffsetDateTime = datetime!(2026-05-01 12:00 UTC);

async fn service_with_user(
    tier: Tier,
) -> (Arc<QuotaService<InMemoryStore>>, Arc<InMemoryStore>, UserId) {
    let store = Arc::new(InMemoryStore::new());
    let clock = ManualClock::new(START);
    let service = Arc::new(QuotaService::new(
        Arc::clone(&store),
        &QuotaConfig::default(),
        Arc::new(clock),
    ));
    let user_id = UserId::new();
    service.provision(user_id).await.unwrap();
    if tier != Tier::Applicant {
        service.upgrade(user_id, tier, None).await.unwrap();
    }
    (service, store, user_id)
}

async fn consume_concurrently(
    service: &Arc<QuotaService<InMemoryStore>>,
    user_id: UserId,
    feature: Feature,
    tasks: usize,
) -> usize {
    let handles: Vec<_> = (0..tasks)
        .map(|_| {
            let service = Arc::clone(service);
            tokio::spawn(async move { service.try_consume(user_id, feature).await })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        let decision = handle.await.unwrap().unwrap();
        if decision.allowed {
            allowed += 1;
        }
    }
    allowed
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_last_unit_goes_to_exactly_one_caller() {
    let (service, store, user_id) = service_with_user(Tier::Candidate).await;

    // Burn 49 of 50 first
    for _ in 0..49 {
        assert!(service.try_consume(user_id, Feature::Optimizations).await.unwrap().allowed);
    }

    let allowed = consume_concurrently(&service, user_id, Feature::Optimizations, 32).await;
    assert_eq!(allowed, 1);

    let record = store.get(user_id).await.unwrap().unwrap();
    assert_eq!(record.monthly_used(Feature::Optimizations), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_consumers_never_overshoot() {
    let (service, store, user_id) = service_with_user(Tier::Applicant).await;

    let allowed = consume_concurrently(&service, user_id, Feature::Optimizations, 100).await;
    assert_eq!(allowed, 10);

    let entries = store.ledger_entries(user_id).await.unwrap();
    let consume: Vec<_> = entries
        .iter()
        .filter(|e| e.operation == LedgerOperation::Consume)
        .collect();
    assert_eq!(consume.len(), 100);
    assert_eq!(
        consume.iter().filter(|e| e.outcome == LedgerOutcome::Allowed).count(),
        10
    );
    assert!(consume.iter().all(|e| e.counter_value_after <= 10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_users_do_not_contend() {
    let store = Arc::new(InMemoryStore::new());
    let service = Arc::new(QuotaService::new(
        Arc::clone(&store),
        &QuotaConfig::default(),
        Arc::new(ManualClock::new(START)),
    ));
    let users: Vec<UserId> = (0..5).map(|_| UserId::new()).collect();
    for user_id in &users {
        service.provision(*user_id).await.unwrap();
    }

    let handles: Vec<_> = users
        .iter()
        .flat_map(|user_id| {
            let user_id = *user_id;
            let service = Arc::clone(&service);
            (0..15).map(move |_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service.try_consume(user_id, Feature::Optimizations).await
                })
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for user_id in users {
        let record = store.get(user_id).await.unwrap().unwrap();
        assert_eq!(record.monthly_used(Feature::Optimizations), 10);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_acquire_release_conserves_gauge() {
    let (service, store, user_id) = service_with_user(Tier::Applicant).await;

    // Pre-fill so releases always have something to give back
    for _ in 0..5 {
        assert!(service.acquire(user_id, Feature::ActiveJobs).await.unwrap().allowed);
    }

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                if i % 2 == 0 {
                    service.acquire(user_id, Feature::ActiveJobs).await
                } else {
                    service.release(user_id, Feature::ActiveJobs).await
                }
            })
        })
        .collect();
    for handle in handles {
        let decision = handle.await.unwrap().unwrap();
        assert!(decision.used <= 10);
    }

    let entries = store.ledger_entries(user_id).await.unwrap();
    let mut expected: i64 = 0;
    for entry in &entries {
        match (entry.operation, entry.outcome) {
            (LedgerOperation::Acquire, LedgerOutcome::Allowed) => expected += 1,
            (LedgerOperation::Release, _) if entry.reason.is_none() => expected -= 1,
            _ => {}
        }
        assert_eq!(entry.counter_value_after, expected);
    }

    let record = store.get(user_id).await.unwrap().unwrap();
    assert_eq!(record.gauge_value(Feature::ActiveJobs), expected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_allowed_is_min_of_remaining_and_callers(prior in 0u32..50, callers in 1usize..64) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let (allowed, used) = runtime.block_on(async {
            let (service, store, user_id) = service_with_user(Tier::Candidate).await;
            if prior > 0 {
                service
                    .try_consume_units(user_id, Feature::Optimizations, prior)
                    .await
                    .unwrap();
            }
            let allowed = consume_concurrently(&service, user_id, Feature::Optimizations, callers).await;
            let record = store.get(user_id).await.unwrap().unwrap();
            (allowed, record.monthly_used(Feature::Optimizations))
        });

        let remaining = (50 - prior) as usize;
        prop_assert_eq!(allowed, remaining.min(callers));
        prop_assert!(used <= 50);
        prop_assert_eq!(used, i64::from(prior) + allowed as i64);
    }

    #[test]
    fn prop_gauge_ends_where_successful_operations_put_it(
        prefill in 0u32..=10,
        ops in proptest::collection::vec(any::<bool>(), 1..48),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let (entries, final_value) = runtime.block_on(async {
            let (service, store, user_id) = service_with_user(Tier::Applicant).await;
            for _ in 0..prefill {
                service.acquire(user_id, Feature::ActiveJobs).await.unwrap();
            }

            let handles: Vec<_> = ops
                .iter()
                .map(|&acquire| {
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        if acquire {
                            service.acquire(user_id, Feature::ActiveJobs).await
                        } else {
                            service.release(user_id, Feature::ActiveJobs).await
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            let entries = store.ledger_entries(user_id).await.unwrap();
            let record = store.get(user_id).await.unwrap().unwrap();
            (entries, record.gauge_value(Feature::ActiveJobs))
        });

        prop_assert_eq!(entries.len(), prefill as usize + ops.len());

        let mut expected: i64 = 0;
        for entry in &entries {
            match (entry.operation, entry.outcome) {
                (LedgerOperation::Acquire, LedgerOutcome::Allowed) => expected += 1,
                (LedgerOperation::Release, _) if entry.reason.is_none() => expected -= 1,
                _ => {}
            }
            prop_assert_eq!(entry.counter_value_after, expected);
            prop_assert!((0..=10).contains(&expected));
        }

        let concurrent = &entries[prefill as usize..];
        let acquired = concurrent
            .iter()
            .filter(|e| e.operation == LedgerOperation::Acquire && e.outcome == LedgerOutcome::Allowed)
            .count() as i64;
        let released = concurrent
            .iter()
            .filter(|e| e.operation == LedgerOperation::Release && e.reason.is_none())
            .count() as i64;
        prop_assert_eq!(final_value, i64::from(prefill) + acquired - released);
        prop_assert!((0..=10).contains(&final_value));
    }
}
