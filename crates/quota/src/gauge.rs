//! Active resource gauge
//!
//! Caps on concurrently live resources (tracked job applications). The gauge
//! goes up on `acquire`, down on `release`, never resets with the cycle, and
//! can be snapped back to ground truth with `reconcile` when a deletion path
//! forgot to release.

use std::sync::Arc;

use quotaguard_shared::{Feature, Limit, MeterKind, TierCatalog, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::enforcer::{applied_limit, ledger_entry, require_meter, Decision, DenialReason};
use crate::error::{QuotaError, QuotaResult};
use crate::ledger::{LedgerBuffer, LedgerOperation};
use crate::record::SubscriptionRecord;
use crate::store::SubscriptionStore;
use crate::transition::expire_if_due;

/// Result of a reconciliation against the live resource count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub user_id: UserId,
    pub feature: Feature,
    pub previous: i64,
    pub current: i64,
}

impl ReconcileOutcome {
    pub fn drifted(&self) -> bool {
        self.previous != self.current
    }
}

pub struct ActiveResourceGauge<S> {
    store: Arc<S>,
    catalog: Arc<TierCatalog>,
    clock: Arc<dyn Clock>,
    enforcement_enabled: bool,
}

impl<S: SubscriptionStore> ActiveResourceGauge<S> {
    pub fn new(
        store: Arc<S>,
        catalog: Arc<TierCatalog>,
        clock: Arc<dyn Clock>,
        enforcement_enabled: bool,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
            enforcement_enabled,
        }
    }

    /// Claim one slot for a newly created resource
    pub async fn acquire(&self, user_id: UserId, feature: Feature) -> QuotaResult<Decision> {
        require_meter(feature, MeterKind::Gauge)?;
        let clock = &self.clock;
        let catalog = &self.catalog;
        let enforced = self.enforcement_enabled;

        let decision = self
            .store
            .transact(user_id, move |record, ledger| {
                let now = clock.now();
                expire_if_due(record, now);

                let tier = record.tier;
                let limit = catalog.limit_for(tier, feature);
                let current = record.gauge_value(feature);

                let denial = match applied_limit(limit, enforced) {
                    Limit::Unlimited => None,
                    Limit::Blocked => Some(DenialReason::FeatureBlocked),
                    Limit::Gauge(cap) if current < i64::from(cap) => None,
                    Limit::Gauge(cap) => Some(DenialReason::GaugeCapReached { limit: cap }),
                    Limit::Monthly(_) => {
                        return Err(QuotaError::FeatureMismatch {
                            feature,
                            expected: MeterKind::Gauge,
                            actual: MeterKind::Monthly,
                        })
                    }
                };

                if denial.is_none() {
                    record.set_counter(feature, current + 1);
                }
                let used = record.gauge_value(feature);

                ledger.append(ledger_entry(
                    record,
                    feature,
                    LedgerOperation::Acquire,
                    denial.is_none(),
                    1,
                    denial.as_ref().map(DenialReason::as_str),
                    now,
                ));

                Ok(Decision {
                    allowed: denial.is_none(),
                    feature,
                    tier,
                    limit,
                    used,
                    remaining: match (denial, enforced) {
                        (Some(_), _) => Some(0),
                        (None, true) => limit.remaining(used),
                        (None, false) => None,
                    },
                    reset_at: None,
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
                "Gauge acquire denied"
            );
        }
        Ok(decision)
    }

    /// Give back the slot of an archived or deleted resource. Releasing an
    /// empty gauge stays at zero.
    pub async fn release(&self, user_id: UserId, feature: Feature) -> QuotaResult<Decision> {
        require_meter(feature, MeterKind::Gauge)?;
        let clock = &self.clock;
        let catalog = &self.catalog;
        let enforced = self.enforcement_enabled;

        self.store
            .transact(user_id, move |record, ledger| {
                let now = clock.now();
                expire_if_due(record, now);

                let tier = record.tier;
                let limit = catalog.limit_for(tier, feature);
                let current = record.gauge_value(feature);

                let reason = if current <= 0 {
                    tracing::warn!(
                        user_id = %record.user_id,
                        feature = %feature,
                        "Gauge release with nothing acquired, clamped at zero"
                    );
                    Some("release_underflow")
                } else {
                    None
                };
                record.set_counter(feature, (current - 1).max(0));
                let used = record.gauge_value(feature);

                ledger.append(ledger_entry(
                    record,
                    feature,
                    LedgerOperation::Release,
                    true,
                    1,
                    reason,
                    now,
                ));

                Ok(Decision {
                    allowed: true,
                    feature,
                    tier,
                    limit,
                    used,
                    remaining: if enforced { limit.remaining(used) } else { None },
                    reset_at: None,
                    denial: None,
                    enforced,
                })
            })
            .await
    }

    /// Overwrite the stored gauge with the externally counted number of live
    /// resources. Not for the hot path.
    ///
    /// The count is only as fresh as the caller's snapshot; prefer
    /// [`reconcile_live`](Self::reconcile_live) when the store can count.
    pub async fn reconcile(
        &self,
        user_id: UserId,
        feature: Feature,
        true_count: u32,
    ) -> QuotaResult<ReconcileOutcome> {
        require_meter(feature, MeterKind::Gauge)?;
        let clock = &self.clock;

        let outcome = self
            .store
            .transact(user_id, move |record, ledger| {
                Ok(snap_to(record, ledger, feature, true_count, clock.now()))
            })
            .await?;
        log_drift(&outcome);
        Ok(outcome)
    }

    /// Snap the gauge to the live resource count the store takes while the
    /// record is locked, so an acquire racing a new resource cannot be undone
    pub async fn reconcile_live(
        &self,
        user_id: UserId,
        feature: Feature,
    ) -> QuotaResult<ReconcileOutcome> {
        require_meter(feature, MeterKind::Gauge)?;
        let clock = &self.clock;

        let outcome = self
            .store
            .transact_live(user_id, feature, move |record, ledger, live| {
                Ok(snap_to(record, ledger, feature, live, clock.now()))
            })
            .await?;
        log_drift(&outcome);
        Ok(outcome)
    }
}

fn snap_to(
    record: &mut SubscriptionRecord,
    ledger: &mut LedgerBuffer,
    feature: Feature,
    true_count: u32,
    now: OffsetDateTime,
) -> ReconcileOutcome {
    let previous = record.gauge_value(feature);
    let current = i64::from(true_count);
    if previous != current {
        record.set_counter(feature, current);
        ledger.append(ledger_entry(
            record,
            feature,
            LedgerOperation::Reconcile,
            true,
            0,
            Some("gauge_drift"),
            now,
        ));
    }
    ReconcileOutcome {
        user_id: record.user_id(),
        feature,
        previous,
        current,
    }
}

fn log_drift(outcome: &ReconcileOutcome) {
    if outcome.drifted() {
        tracing::warn!(
            user_id = %outcome.user_id,
            feature = %outcome.feature,
            stored = outcome.previous,
            live = outcome.current,
            "Gauge drift corrected"
        );
    }
}
