//! Read-only usage summary for display
//!
//! Reads outside any transaction and projects a stale cycle as reset and a lapsed
//! tier as expired, but persists nothing. Numbers here are advisory; only
//! the enforcer's decision is authoritative.

use quotaguard_shared::{Feature, Limit, MeterKind, Tier, TierCatalog, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::cycle::CycleResetScheduler;
use crate::enforcer::applied_limit;
use crate::record::SubscriptionRecord;
use crate::transition::effective_tier;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureUsage {
    pub feature: Feature,
    pub meter: MeterKind,
    pub limit: Limit,
    pub used: i64,
    pub remaining: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub user_id: UserId,
    pub tier: Tier,
    #[serde(with = "time::serde::rfc3339::option")]
    pub tier_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_anchor: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_at: OffsetDateTime,
    pub features: Vec<FeatureUsage>,
    pub enforced: bool,
}

impl UsageSummary {
    pub fn feature(&self, feature: Feature) -> Option<&FeatureUsage> {
        self.features.iter().find(|usage| usage.feature == feature)
    }
}

pub(crate) fn summarize(
    record: &SubscriptionRecord,
    catalog: &TierCatalog,
    scheduler: &CycleResetScheduler,
    enforcement_enabled: bool,
    now: OffsetDateTime,
) -> UsageSummary {
    let stale = scheduler.is_stale(record.cycle_anchor(), now);
    let cycle_anchor = if stale {
        scheduler.next_anchor(record.cycle_anchor(), now)
    } else {
        record.cycle_anchor()
    };

    let tier = effective_tier(record, now);
    let tier_expires_at = if tier == record.tier() {
        record.tier_expires_at()
    } else {
        None
    };

    let features = catalog
        .all_features()
        .iter()
        .map(|&feature| {
            let limit = catalog.limit_for(tier, feature);
            let used = match feature.meter() {
                MeterKind::Monthly if stale => 0,
                MeterKind::Monthly => record.monthly_used(feature),
                MeterKind::Gauge => record.gauge_value(feature),
            };
            let remaining = match applied_limit(limit, enforcement_enabled) {
                Limit::Unlimited => None,
                applied => applied.remaining(used),
            };
            FeatureUsage {
                feature,
                meter: feature.meter(),
                limit,
                used,
                remaining,
            }
        })
        .collect();

    UsageSummary {
        user_id: record.user_id(),
        tier,
        tier_expires_at,
        cycle_anchor,
        reset_at: scheduler.reset_at(cycle_anchor),
        features,
        enforced: enforcement_enabled,
    }
}
