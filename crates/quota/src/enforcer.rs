//! Quota enforcement for monthly-metered features
//!
//! `try_consume` is the hot path: one locked transaction per call that rolls
//! over a stale cycle, applies a lapsed tier's downgrade, tests the limit,
//! increments, and appends a ledger entry. Two concurrent calls for the same
//! user can never both see room for the last unit.

use std::sync::Arc;

use quotaguard_shared::{Feature, Limit, MeterKind, Tier, TierCatalog, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::cycle::CycleResetScheduler;
use crate::error::{QuotaError, QuotaResult};
use crate::ledger::{LedgerOperation, LedgerOutcome, UsageLedgerEntry};
use crate::record::SubscriptionRecord;
use crate::store::SubscriptionStore;
use crate::transition::expire_if_due;

/// Largest single request; the ledger stores units as a 32-bit signed integer
pub const MAX_UNITS: u32 = i32::MAX as u32;

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    /// The user's tier does not include this feature
    FeatureBlocked,
    /// Monthly allowance used up until `reset_at`
    QuotaExhausted {
        #[serde(with = "time::serde::rfc3339")]
        reset_at: OffsetDateTime,
    },
    /// Too many live resources of this kind
    GaugeCapReached { limit: u32 },
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeatureBlocked => "feature_blocked",
            Self::QuotaExhausted { .. } => "quota_exhausted",
            Self::GaugeCapReached { .. } => "gauge_cap_reached",
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub feature: Feature,
    /// Tier the request was measured against
    pub tier: Tier,
    pub limit: Limit,
    /// Counter value after this call
    pub used: i64,
    /// Units left; `None` when unlimited
    pub remaining: Option<u32>,
    /// End of the current cycle for monthly features
    #[serde(with = "time::serde::rfc3339::option")]
    pub reset_at: Option<OffsetDateTime>,
    pub denial: Option<DenialReason>,
    /// False when enforcement is switched off by configuration
    pub enforced: bool,
}

/// Limit the check should apply. With enforcement off everything is
/// unlimited.
pub(crate) fn applied_limit(limit: Limit, enforcement_enabled: bool) -> Limit {
    if enforcement_enabled {
        limit
    } else {
        Limit::Unlimited
    }
}

pub(crate) fn ledger_entry(
    record: &SubscriptionRecord,
    feature: Feature,
    operation: LedgerOperation,
    decision_allowed: bool,
    units: u32,
    reason: Option<&str>,
    now: OffsetDateTime,
) -> UsageLedgerEntry {
    UsageLedgerEntry {
        user_id: record.user_id,
        feature,
        operation,
        outcome: if decision_allowed {
            LedgerOutcome::Allowed
        } else {
            LedgerOutcome::Denied
        },
        tier_at_time: record.tier,
        counter_value_after: record.counter(feature),
        units,
        reason: reason.map(str::to_string),
        recorded_at: now,
    }
}

pub(crate) fn require_meter(feature: Feature, expected: MeterKind) -> QuotaResult<()> {
    if feature.meter() != expected {
        return Err(QuotaError::FeatureMismatch {
            feature,
            expected,
            actual: feature.meter(),
        });
    }
    Ok(())
}

pub struct QuotaEnforcer<S> {
    store: Arc<S>,
    catalog: Arc<TierCatalog>,
    scheduler: CycleResetScheduler,
    clock: Arc<dyn Clock>,
    enforcement_enabled: bool,
}

impl<S: SubscriptionStore> QuotaEnforcer<S> {
    pub fn new(
        store: Arc<S>,
        catalog: Arc<TierCatalog>,
        scheduler: CycleResetScheduler,
        clock: Arc<dyn Clock>,
        enforcement_enabled: bool,
    ) -> Self {
        if !enforcement_enabled {
            tracing::warn!("Quota enforcement disabled; all limits are treated as unlimited");
        }
        Self {
            store,
            catalog,
            scheduler,
            clock,
            enforcement_enabled,
        }
    }

    pub fn enforcement_enabled(&self) -> bool {
        self.enforcement_enabled
    }

    /// Consume one unit of a monthly feature
    pub async fn try_consume(&self, user_id: UserId, feature: Feature) -> QuotaResult<Decision> {
        self.try_consume_units(user_id, feature, 1).await
    }

    pub async fn try_consume_units(
        &self,
        user_id: UserId,
        feature: Feature,
        units: u32,
    ) -> QuotaResult<Decision> {
        if units == 0 {
            return Err(QuotaError::InvalidInput("units must be positive".to_string()));
        }
        if units > MAX_UNITS {
            return Err(QuotaError::InvalidInput(format!(
                "units must be at most {}",
                MAX_UNITS
            )));
        }
        require_meter(feature, MeterKind::Monthly)?;

        let clock = &self.clock;
        let catalog = &self.catalog;
        let scheduler = self.scheduler;
        let enforced = self.enforcement_enabled;

        let decision = self
            .store
            .transact(user_id, move |record, ledger| {
                let now = clock.now();
                scheduler.roll_over(record, now);
                expire_if_due(record, now);

                let tier = record.tier;
                let limit = catalog.limit_for(tier, feature);
                let used = record.monthly_used(feature);
                let reset_at = scheduler.reset_at(record.cycle_anchor);
                let wanted = used + i64::from(units);

                let denial = match applied_limit(limit, enforced) {
                    Limit::Unlimited => None,
                    Limit::Blocked => Some(DenialReason::FeatureBlocked),
                    Limit::Monthly(cap) if wanted <= i64::from(cap) => None,
                    Limit::Monthly(_) => Some(DenialReason::QuotaExhausted { reset_at }),
                    Limit::Gauge(_) => {
                        return Err(QuotaError::FeatureMismatch {
                            feature,
                            expected: MeterKind::Monthly,
                            actual: MeterKind::Gauge,
                        })
                    }
                };

                if denial.is_none() {
                    record.set_counter(feature, wanted);
                }
                let used = record.monthly_used(feature);
                let remaining = match (denial, enforced) {
                    (Some(_), _) => Some(0),
                    (None, true) => limit.remaining(used),
                    (None, false) => None,
                };

                ledger.append(ledger_entry(
                    record,
                    feature,
                    LedgerOperation::Consume,
                    denial.is_none(),
                    units,
                    denial.as_ref().map(DenialReason::as_str),
                    now,
                ));

                Ok(Decision {
                    allowed: denial.is_none(),
                    feature,
                    tier,
                    limit,
                    used,
                    remaining,
                    reset_at: Some(reset_at),
                    denial,
                    enforced,
                })
            })
            .await?;

        if let Some(reason) = decision.denial {
            tracing::debug!(
                user_id = %user_id,
                feature = %feature,
                tier = %decision.tier,
                used = decision.used,
                reason = reason.as_str(),
                "Quota denied"
            );
        }
        Ok(decision)
    }
}
