//! Tier transitions
//!
//! Upgrades, downgrades, expirations and legacy-identifier migration. No
//! transition touches counters: consumed-so-far usage is measured against the
//! new tier's limit, and gauges only move with resources.

use std::sync::Arc;

use quotaguard_shared::{Tier, UserId, LEGACY_TIER_MIGRATIONS, LEGACY_TIER_MIGRATION_VERSION};
use serde::Serialize;
use time::OffsetDateTime;

use crate::clock::Clock;
use crate::error::{QuotaError, QuotaResult};
use crate::record::SubscriptionRecord;
use crate::store::SubscriptionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Upgrade,
    Downgrade,
    Expire,
    /// Administrative change in any direction, including renewing the
    /// expiry on the current tier
    AdminSet,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upgrade => write!(f, "upgrade"),
            Self::Downgrade => write!(f, "downgrade"),
            Self::Expire => write!(f, "expire"),
            Self::AdminSet => write!(f, "admin_set"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierTransition {
    pub user_id: UserId,
    pub from: Tier,
    pub to: Tier,
    pub kind: TransitionKind,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Caller-supplied permission check for administrative tier changes
pub trait TierChangeAuthorizer: Send + Sync {
    fn authorize(&self, user_id: UserId, new_tier: Tier) -> bool;
}

/// Tier the record should be measured against at `now`
pub fn effective_tier(record: &SubscriptionRecord, now: OffsetDateTime) -> Tier {
    match record.tier_expires_at {
        Some(expires_at) if expires_at <= now => Tier::lowest(),
        _ => record.tier,
    }
}

/// Persisted form of the lazy downgrade: if the paid period is over, drop
/// the record to the lowest tier. Runs inside whichever transaction touches
/// the record first after expiry.
pub(crate) fn expire_if_due(
    record: &mut SubscriptionRecord,
    now: OffsetDateTime,
) -> Option<TierTransition> {
    let expires_at = record.tier_expires_at?;
    if expires_at > now {
        return None;
    }

    let transition = TierTransition {
        user_id: record.user_id,
        from: record.tier,
        to: Tier::lowest(),
        kind: TransitionKind::Expire,
        expires_at: None,
        at: now,
    };
    record.tier = Tier::lowest();
    record.tier_expires_at = None;

    tracing::info!(
        user_id = %transition.user_id,
        from = %transition.from,
        expired_at = %expires_at,
        "Tier expired, downgraded to {}",
        transition.to
    );
    Some(transition)
}

fn check_future(expires_at: Option<OffsetDateTime>, now: OffsetDateTime) -> QuotaResult<()> {
    match expires_at {
        Some(at) if at <= now => Err(QuotaError::InvalidInput(format!(
            "tier expiry {} is not in the future",
            at
        ))),
        _ => Ok(()),
    }
}

pub struct TierTransitionManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: SubscriptionStore> TierTransitionManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Move to a strictly higher tier
    pub async fn upgrade(
        &self,
        user_id: UserId,
        new_tier: Tier,
        expires_at: Option<OffsetDateTime>,
    ) -> QuotaResult<TierTransition> {
        self.change(user_id, new_tier, expires_at, TransitionKind::Upgrade)
            .await
    }

    /// Move to a strictly lower tier
    pub async fn downgrade(
        &self,
        user_id: UserId,
        new_tier: Tier,
        expires_at: Option<OffsetDateTime>,
    ) -> QuotaResult<TierTransition> {
        self.change(user_id, new_tier, expires_at, TransitionKind::Downgrade)
            .await
    }

    /// Apply a pending expiry now. Returns `None` if the tier has not expired.
    pub async fn expire(&self, user_id: UserId) -> QuotaResult<Option<TierTransition>> {
        let clock = &self.clock;
        self.store
            .transact(user_id, move |record, _| Ok(expire_if_due(record, clock.now())))
            .await
    }

    /// Administrative/billing entry point. The authorizer is consulted before
    /// anything is read or written.
    pub async fn set_tier(
        &self,
        user_id: UserId,
        new_tier: Tier,
        expires_at: Option<OffsetDateTime>,
        authorizer: &dyn TierChangeAuthorizer,
    ) -> QuotaResult<TierTransition> {
        if !authorizer.authorize(user_id, new_tier) {
            tracing::warn!(user_id = %user_id, new_tier = %new_tier, "Tier change refused by authorizer");
            return Err(QuotaError::Unauthorized(format!(
                "tier change to {} for user {} was not authorized",
                new_tier, user_id
            )));
        }
        self.change(user_id, new_tier, expires_at, TransitionKind::AdminSet)
            .await
    }

    /// Remap one retired tier identifier. Running it again changes nothing.
    pub async fn migrate(&self, legacy: &str, new_tier: Tier) -> QuotaResult<u64> {
        if legacy.parse::<Tier>().is_ok() {
            return Err(QuotaError::InvalidInput(format!(
                "'{}' is a current tier identifier, not a legacy one",
                legacy
            )));
        }
        let changed = self.store.remap_tier(legacy, new_tier).await?;
        if changed > 0 {
            tracing::info!(legacy = %legacy, tier = %new_tier, changed, "Migrated legacy tier identifier");
        }
        Ok(changed)
    }

    /// Apply every entry of the legacy migration table
    pub async fn migrate_legacy_tiers(&self) -> QuotaResult<u64> {
        let mut total = 0;
        for (legacy, tier) in LEGACY_TIER_MIGRATIONS {
            total += self.migrate(legacy, *tier).await?;
        }
        tracing::info!(
            version = LEGACY_TIER_MIGRATION_VERSION,
            changed = total,
            "Legacy tier migration complete"
        );
        Ok(total)
    }

    async fn change(
        &self,
        user_id: UserId,
        new_tier: Tier,
        expires_at: Option<OffsetDateTime>,
        kind: TransitionKind,
    ) -> QuotaResult<TierTransition> {
        if new_tier == Tier::lowest() && expires_at.is_some() {
            return Err(QuotaError::InvalidInput(format!(
                "{} does not expire",
                Tier::lowest()
            )));
        }
        let clock = &self.clock;
        check_future(expires_at, clock.now())?;

        let transition = self
            .store
            .transact(user_id, move |record, _| {
                // Checked again in case the lock wait crossed the deadline
                let now = clock.now();
                check_future(expires_at, now)?;
                expire_if_due(record, now);
                let from = record.tier;
                let valid = match kind {
                    TransitionKind::Upgrade => new_tier > from,
                    TransitionKind::Downgrade => new_tier < from,
                    TransitionKind::AdminSet => true,
                    TransitionKind::Expire => false,
                };
                if !valid {
                    return Err(QuotaError::InvalidTransition { from, to: new_tier });
                }
                record.tier = new_tier;
                record.tier_expires_at = expires_at;
                Ok(TierTransition {
                    user_id,
                    from,
                    to: new_tier,
                    kind,
                    expires_at,
                    at: now,
                })
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            from = %transition.from,
            to = %transition.to,
            kind = %transition.kind,
            "Tier changed"
        );
        Ok(transition)
    }
}
