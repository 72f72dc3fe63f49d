//! Subscription record storage
//!
//! All enforcement-bearing mutation goes through [`SubscriptionStore::transact`]:
//! the backend locks the user's row, hands the closure a sanitized record and
//! a ledger buffer, then persists both atomically. If the closure returns an
//! error nothing is written. Reads through [`SubscriptionStore::get`] take no
//! lock and are advisory only.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use std::collections::BTreeMap;
use std::future::Future;

use quotaguard_shared::{Feature, Tier, UserId};
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::QuotaResult;
use crate::ledger::{LedgerBuffer, UsageLedgerEntry};
use crate::record::SubscriptionRecord;

pub trait SubscriptionStore: Send + Sync {
    /// Persist a new record. Fails with `AlreadyExists` if the user has one.
    fn insert(&self, record: SubscriptionRecord) -> impl Future<Output = QuotaResult<()>> + Send;

    /// Non-locking read for display purposes; may be slightly stale
    fn get(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = QuotaResult<Option<SubscriptionRecord>>> + Send;

    /// Run `f` against the user's record under an exclusive lock.
    ///
    /// Calls for the same user are strictly serialized. The record and every
    /// ledger entry appended to the buffer are committed together, or not at
    /// all when `f` fails or the store times out.
    fn transact<T, F>(&self, user_id: UserId, f: F) -> impl Future<Output = QuotaResult<T>> + Send
    where
        T: Send,
        F: FnOnce(&mut SubscriptionRecord, &mut LedgerBuffer) -> QuotaResult<T> + Send;

    /// Like [`transact`](Self::transact), but `f` also receives the number of
    /// live resources backing the gauge `feature`, counted while the record is
    /// locked. A resource created and acquired concurrently is either counted
    /// here or blocked on the lock until this transaction commits.
    fn transact_live<T, F>(
        &self,
        user_id: UserId,
        feature: Feature,
        f: F,
    ) -> impl Future<Output = QuotaResult<T>> + Send
    where
        T: Send,
        F: FnOnce(&mut SubscriptionRecord, &mut LedgerBuffer, u32) -> QuotaResult<T> + Send;

    /// Ledger entries for one user, oldest first
    fn ledger_entries(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = QuotaResult<Vec<UsageLedgerEntry>>> + Send;

    /// Rewrite every record stored under the `legacy` tier identifier.
    /// Returns the number of records changed.
    fn remap_tier(&self, legacy: &str, tier: Tier) -> impl Future<Output = QuotaResult<u64>> + Send;

    /// Every user with a record, in id order
    fn list_users(&self) -> impl Future<Output = QuotaResult<Vec<UserId>>> + Send;
}

/// Stored shape of a record: tier and feature identifiers as raw strings
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub user_id: Uuid,
    pub tier: String,
    pub tier_expires_at: Option<OffsetDateTime>,
    pub cycle_anchor: OffsetDateTime,
    pub monthly_counters: Json<BTreeMap<String, i64>>,
    pub gauge_counters: Json<BTreeMap<String, i64>>,
}

impl SubscriptionRow {
    pub fn from_record(record: &SubscriptionRecord) -> Self {
        Self {
            user_id: record.user_id.0,
            tier: record.tier.to_string(),
            tier_expires_at: record.tier_expires_at,
            cycle_anchor: record.cycle_anchor,
            monthly_counters: Json(encode_counters(&record.monthly_counters)),
            gauge_counters: Json(encode_counters(&record.gauge_counters)),
        }
    }

    pub fn into_record(self) -> QuotaResult<SubscriptionRecord> {
        Ok(SubscriptionRecord {
            user_id: UserId(self.user_id),
            tier: self.tier.parse()?,
            tier_expires_at: self.tier_expires_at,
            cycle_anchor: self.cycle_anchor,
            monthly_counters: decode_counters(self.monthly_counters.0)?,
            gauge_counters: decode_counters(self.gauge_counters.0)?,
        })
    }
}

fn encode_counters(counters: &BTreeMap<Feature, i64>) -> BTreeMap<String, i64> {
    counters
        .iter()
        .map(|(feature, value)| (feature.to_string(), *value))
        .collect()
}

fn decode_counters(raw: BTreeMap<String, i64>) -> QuotaResult<BTreeMap<Feature, i64>> {
    raw.into_iter()
        .map(|(feature, value)| -> QuotaResult<(Feature, i64)> {
            Ok((feature.parse::<Feature>()?, value))
        })
        .collect()
}

/// Decode a row and repair counter invariants, logging every repair.
/// The flag is true when anything had to be corrected.
pub(crate) fn load_record(row: SubscriptionRow) -> QuotaResult<(SubscriptionRecord, bool)> {
    let mut record = row.into_record()?;
    let corrections = record.sanitize();
    for corruption in &corrections {
        tracing::error!(
            user_id = %record.user_id,
            feature = %corruption.feature,
            value = corruption.value,
            "Counter corruption detected: {}",
            corruption
        );
    }
    Ok((record, !corrections.is_empty()))
}
