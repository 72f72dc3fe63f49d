//! End-to-end subscription lifecycle through the service facade

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use quotaguard_quota::{
    DenialReason, InMemoryStore, LedgerOperation, ManualClock, QuotaConfig, QuotaError,
    QuotaService, SubscriptionRow, SubscriptionStore, TierChangeAuthorizer,
};
use quotaguard_shared::{Feature, Limit, Tier, UserId};
use sqlx::types::Json;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

const START: OffsetDateTime = datetime!(2026-06-01 00:00 UTC);

struct BillingWebhook;

impl TierChangeAuthorizer for BillingWebhook {
    fn authorize(&self, _user_id: UserId, _new_tier: Tier) -> bool {
        true
    }
}

struct Support;

impl TierChangeAuthorizer for Support {
    fn authorize(&self, _user_id: UserId, new_tier: Tier) -> bool {
        new_tier != Tier::Executive
    }
}

fn service(config: QuotaConfig) -> (QuotaService<InMemoryStore>, Arc<InMemoryStore>, ManualClock) {
    let store = Arc::new(InMemoryStore::new());
    let clock = ManualClock::new(START);
    let service = QuotaService::new(Arc::clone(&store), &config, Arc::new(clock.clone()));
    (service, store, clock)
}

#[tokio::test]
async fn test_candidate_uses_full_allowance_then_resets() {
    let (service, _, clock) = service(QuotaConfig::default());
    let user_id = UserId::new();
    service.provision(user_id).await.unwrap();
    service.upgrade(user_id, Tier::Candidate, None).await.unwrap();

    for expected in (0..50).rev() {
        let decision = service.try_consume(user_id, Feature::Optimizations).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(expected));
    }

    let denied = service.try_consume(user_id, Feature::Optimizations).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, Some(0));
    let reset_at = START + Duration::days(30);
    assert_eq!(denied.reset_at, Some(reset_at));
    assert_eq!(denied.denial, Some(DenialReason::QuotaExhausted { reset_at }));

    clock.set(reset_at + Duration::minutes(1));
    let decision = service.try_consume(user_id, Feature::Optimizations).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, Some(49));
    assert_eq!(decision.reset_at, Some(START + Duration::days(60)));
}

#[tokio::test]
async fn test_applicant_job_cap() {
    let (service, _, _) = service(QuotaConfig::default());
    let user_id = UserId::new();
    service.provision(user_id).await.unwrap();

    for _ in 0..10 {
        assert!(service.acquire(user_id, Feature::ActiveJobs).await.unwrap().allowed);
    }
    let denied = service.acquire(user_id, Feature::ActiveJobs).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.denial, Some(DenialReason::GaugeCapReached { limit: 10 }));

    service.release(user_id, Feature::ActiveJobs).await.unwrap();
    assert!(service.acquire(user_id, Feature::ActiveJobs).await.unwrap().allowed);

    let summary = service.get_usage_summary(user_id).await.unwrap();
    let jobs = summary.feature(Feature::ActiveJobs).unwrap();
    assert_eq!(jobs.used, 10);
    assert_eq!(jobs.remaining, Some(0));
}

#[tokio::test]
async fn test_downgrade_mid_cycle_keeps_consumed_usage() {
    let (service, _, _) = service(QuotaConfig::default());
    let user_id = UserId::new();
    service.provision(user_id).await.unwrap();
    service.upgrade(user_id, Tier::Candidate, None).await.unwrap();
    service
        .try_consume_units(user_id, Feature::Optimizations, 40)
        .await
        .unwrap();

    service.downgrade(user_id, Tier::Applicant, None).await.unwrap();

    let denied = service.try_consume(user_id, Feature::Optimizations).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.used, 40);
    assert_eq!(denied.remaining, Some(0));
    assert_eq!(denied.limit, Limit::Monthly(10));

    let summary = service.get_usage_summary(user_id).await.unwrap();
    assert_eq!(summary.tier, Tier::Applicant);
    assert_eq!(summary.feature(Feature::Optimizations).unwrap().remaining, Some(0));
}

#[tokio::test]
async fn test_paid_period_lapses_without_a_job() {
    let (service, store, clock) = service(QuotaConfig::default());
    let user_id = UserId::new();
    service.provision(user_id).await.unwrap();
    service
        .set_tier(user_id, Tier::Executive, Some(START + Duration::days(7)), &BillingWebhook)
        .await
        .unwrap();

    assert!(service.try_consume(user_id, Feature::AtsReports).await.unwrap().allowed);

    clock.advance(Duration::days(8));

    // Summary projects the lapse but does not write it
    let summary = service.get_usage_summary(user_id).await.unwrap();
    assert_eq!(summary.tier, Tier::Applicant);
    assert_eq!(store.get(user_id).await.unwrap().unwrap().tier(), Tier::Executive);

    let denied = service.try_consume(user_id, Feature::AtsReports).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.tier, Tier::Applicant);
    assert_eq!(denied.denial, Some(DenialReason::FeatureBlocked));

    let record = store.get(user_id).await.unwrap().unwrap();
    assert_eq!(record.tier(), Tier::Applicant);
    assert_eq!(record.tier_expires_at(), None);
}

#[tokio::test]
async fn test_set_tier_respects_authorizer() {
    let (service, _, _) = service(QuotaConfig::default());
    let user_id = UserId::new();
    service.provision(user_id).await.unwrap();

    let err = service
        .set_tier(user_id, Tier::Executive, None, &Support)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Unauthorized(_)));

    service
        .set_tier(user_id, Tier::Candidate, None, &Support)
        .await
        .unwrap();
    let summary = service.get_usage_summary(user_id).await.unwrap();
    assert_eq!(summary.tier, Tier::Candidate);
}

#[tokio::test]
async fn test_cycle_reset_happens_once() {
    let (service, _, clock) = service(QuotaConfig::default());
    let user_id = UserId::new();
    service.provision(user_id).await.unwrap();
    for _ in 0..10 {
        service.try_consume(user_id, Feature::Optimizations).await.unwrap();
    }

    clock.advance(Duration::days(30));
    let first = service.try_consume(user_id, Feature::Optimizations).await.unwrap();
    let second = service.try_consume(user_id, Feature::Optimizations).await.unwrap();
    assert_eq!(first.used, 1);
    assert_eq!(second.used, 2);
    assert_eq!(first.reset_at, second.reset_at);
}

#[tokio::test]
async fn test_provision_twice_fails() {
    let (service, _, _) = service(QuotaConfig::default());
    let user_id = UserId::new();
    service.provision(user_id).await.unwrap();
    let err = service.provision(user_id).await.unwrap_err();
    assert!(matches!(err, QuotaError::AlreadyExists(id) if id == user_id));

    let missing = UserId::new();
    let err = service.get_usage_summary(missing).await.unwrap_err();
    assert!(matches!(err, QuotaError::SubscriptionNotFound(_)));
}

#[tokio::test]
async fn test_legacy_tiers_are_migrated_once() {
    let (service, store, _) = service(QuotaConfig::default());
    let legacy_users: Vec<(UserId, &str)> = vec![
        (UserId::new(), "professional"),
        (UserId::new(), "Premium"),
        (UserId::new(), "free"),
    ];
    for (user_id, tier) in &legacy_users {
        store
            .insert_row(SubscriptionRow {
                user_id: user_id.0,
                tier: tier.to_string(),
                tier_expires_at: None,
                cycle_anchor: START,
                monthly_counters: Json(BTreeMap::from([("optimizations".to_string(), 3)])),
                gauge_counters: Json(BTreeMap::new()),
            })
            .await;
    }

    // Unmigrated identifiers are not silently treated as some tier
    let err = service
        .try_consume(legacy_users[0].0, Feature::Optimizations)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::TierNotFound(_)));

    assert_eq!(service.migrate_legacy_tiers().await.unwrap(), 3);
    assert_eq!(service.migrate_legacy_tiers().await.unwrap(), 0);

    let tiers: Vec<Tier> = {
        let mut tiers = Vec::new();
        for (user_id, _) in &legacy_users {
            tiers.push(service.get_usage_summary(*user_id).await.unwrap().tier);
        }
        tiers
    };
    assert_eq!(tiers, vec![Tier::Candidate, Tier::Executive, Tier::Applicant]);

    let decision = service
        .try_consume(legacy_users[0].0, Feature::Optimizations)
        .await
        .unwrap();
    assert_eq!(decision.used, 4);
}

#[tokio::test]
async fn test_disabled_enforcement_still_meters() {
    let config = QuotaConfig {
        enforcement_enabled: false,
        ..QuotaConfig::default()
    };
    let (service, _, _) = service(config);
    let user_id = UserId::new();
    service.provision(user_id).await.unwrap();

    for _ in 0..15 {
        let decision = service.try_consume(user_id, Feature::Optimizations).await.unwrap();
        assert!(decision.allowed);
        assert!(!decision.enforced);
    }
    let entries = service.ledger_entries(user_id).await.unwrap();
    assert_eq!(entries.len(), 15);
    assert!(entries.iter().all(|e| e.operation == LedgerOperation::Consume));
    assert_eq!(entries[14].counter_value_after, 15);
}
