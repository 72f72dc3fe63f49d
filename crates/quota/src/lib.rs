//! QuotaGuard quota library
//!
//! Tier-based quota gating: monthly allowances, live-resource gauges, lazy
//! cycle reset and tier expiry, all applied under a per-user lock so that
//! concurrent requests can never overshoot a limit.

pub mod clock;
pub mod config;
pub mod cycle;
pub mod enforcer;
pub mod error;
pub mod gauge;
pub mod ledger;
pub mod record;
pub mod store;
pub mod summary;
pub mod transition;

use std::sync::Arc;

use quotaguard_shared::{Feature, Tier, TierCatalog, UserId};
use time::OffsetDateTime;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, QuotaConfig};
pub use cycle::CycleResetScheduler;
pub use enforcer::{Decision, DenialReason, QuotaEnforcer};
pub use error::{QuotaError, QuotaResult};
pub use gauge::{ActiveResourceGauge, ReconcileOutcome};
pub use ledger::{LedgerOperation, LedgerOutcome, UsageLedgerEntry};
pub use record::{CounterCorruption, SubscriptionRecord};
pub use store::{InMemoryStore, PgStore, SubscriptionRow, SubscriptionStore};
pub use summary::{FeatureUsage, UsageSummary};
pub use transition::{
    effective_tier, TierChangeAuthorizer, TierTransition, TierTransitionManager, TransitionKind,
};

/// Everything a request handler needs, wired to one store
pub struct QuotaService<S> {
    store: Arc<S>,
    catalog: Arc<TierCatalog>,
    scheduler: CycleResetScheduler,
    clock: Arc<dyn Clock>,
    enforcement_enabled: bool,
    enforcer: QuotaEnforcer<S>,
    gauge: ActiveResourceGauge<S>,
    transitions: TierTransitionManager<S>,
}

impl<S: SubscriptionStore> QuotaService<S> {
    /// Service using the standard tier catalog
    pub fn new(store: Arc<S>, config: &QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_catalog(store, TierCatalog::standard(), config, clock)
    }

    pub fn with_catalog(
        store: Arc<S>,
        catalog: TierCatalog,
        config: &QuotaConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let scheduler = CycleResetScheduler::new(config.cycle_length);
        let enforcement_enabled = config.enforcement_enabled;

        tracing::info!(
            catalog_version = catalog.version(),
            cycle_days = scheduler.cycle_length().whole_days(),
            enforcement_enabled,
            "Quota service initialized"
        );

        Self {
            enforcer: QuotaEnforcer::new(
                Arc::clone(&store),
                Arc::clone(&catalog),
                scheduler,
                Arc::clone(&clock),
                enforcement_enabled,
            ),
            gauge: ActiveResourceGauge::new(
                Arc::clone(&store),
                Arc::clone(&catalog),
                Arc::clone(&clock),
                enforcement_enabled,
            ),
            transitions: TierTransitionManager::new(Arc::clone(&store), Arc::clone(&clock)),
            store,
            catalog,
            scheduler,
            clock,
            enforcement_enabled,
        }
    }

    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// Create the record for a new user: lowest tier, empty counters, cycle
    /// anchored at now
    pub async fn provision(&self, user_id: UserId) -> QuotaResult<SubscriptionRecord> {
        let record = SubscriptionRecord::new(user_id, self.clock.now());
        self.store.insert(record.clone()).await?;
        tracing::info!(user_id = %user_id, tier = %record.tier(), "Subscription record provisioned");
        Ok(record)
    }

    pub async fn try_consume(&self, user_id: UserId, feature: Feature) -> QuotaResult<Decision> {
        self.enforcer.try_consume(user_id, feature).await
    }

    pub async fn try_consume_units(
        &self,
        user_id: UserId,
        feature: Feature,
        units: u32,
    ) -> QuotaResult<Decision> {
        self.enforcer.try_consume_units(user_id, feature, units).await
    }

    pub async fn acquire(&self, user_id: UserId, feature: Feature) -> QuotaResult<Decision> {
        self.gauge.acquire(user_id, feature).await
    }

    pub async fn release(&self, user_id: UserId, feature: Feature) -> QuotaResult<Decision> {
        self.gauge.release(user_id, feature).await
    }

    pub async fn reconcile(
        &self,
        user_id: UserId,
        feature: Feature,
        true_count: u32,
    ) -> QuotaResult<ReconcileOutcome> {
        self.gauge.reconcile(user_id, feature, true_count).await
    }

    /// Reconcile against the live resource count taken under the record lock
    pub async fn reconcile_live(
        &self,
        user_id: UserId,
        feature: Feature,
    ) -> QuotaResult<ReconcileOutcome> {
        self.gauge.reconcile_live(user_id, feature).await
    }

    pub async fn list_users(&self) -> QuotaResult<Vec<UserId>> {
        self.store.list_users().await
    }

    /// Advisory snapshot for display. Never use it to gate an action.
    pub async fn get_usage_summary(&self, user_id: UserId) -> QuotaResult<UsageSummary> {
        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or(QuotaError::SubscriptionNotFound(user_id))?;
        Ok(summary::summarize(
            &record,
            &self.catalog,
            &self.scheduler,
            self.enforcement_enabled,
            self.clock.now(),
        ))
    }

    pub async fn set_tier(
        &self,
        user_id: UserId,
        new_tier: Tier,
        expires_at: Option<OffsetDateTime>,
        authorizer: &dyn TierChangeAuthorizer,
    ) -> QuotaResult<TierTransition> {
        self.transitions
            .set_tier(user_id, new_tier, expires_at, authorizer)
            .await
    }

    pub async fn upgrade(
        &self,
        user_id: UserId,
        new_tier: Tier,
        expires_at: Option<OffsetDateTime>,
    ) -> QuotaResult<TierTransition> {
        self.transitions.upgrade(user_id, new_tier, expires_at).await
    }

    pub async fn downgrade(
        &self,
        user_id: UserId,
        new_tier: Tier,
        expires_at: Option<OffsetDateTime>,
    ) -> QuotaResult<TierTransition> {
        self.transitions.downgrade(user_id, new_tier, expires_at).await
    }

    pub async fn expire(&self, user_id: UserId) -> QuotaResult<Option<TierTransition>> {
        self.transitions.expire(user_id).await
    }

    pub async fn migrate(&self, legacy: &str, new_tier: Tier) -> QuotaResult<u64> {
        self.transitions.migrate(legacy, new_tier).await
    }

    pub async fn migrate_legacy_tiers(&self) -> QuotaResult<u64> {
        self.transitions.migrate_legacy_tiers().await
    }

    pub async fn ledger_entries(&self, user_id: UserId) -> QuotaResult<Vec<UsageLedgerEntry>> {
        self.store.ledger_entries(user_id).await
    }
}
