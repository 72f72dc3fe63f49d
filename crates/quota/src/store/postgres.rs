//! Postgres-backed store
//!
//! Transactions lock the user's row with `SELECT ... FOR UPDATE`, so
//! concurrent callers for the same user queue on the database. Everything up
//! to the commit runs under `tokio::time::timeout`; when it elapses the
//! transaction is dropped, which rolls it back. The commit itself is awaited
//! to completion so a caller never sees a timeout for work that was kept.

use std::future::Future;
use std::time::Duration;

use quotaguard_shared::{Feature, MeterKind, Tier, UserId};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{load_record, SubscriptionRow, SubscriptionStore};
use crate::error::{QuotaError, QuotaResult};
use crate::ledger::{LedgerBuffer, UsageLedgerEntry};
use crate::record::SubscriptionRecord;

const SELECT_RECORD: &str = r#"
    SELECT user_id, tier, tier_expires_at, cycle_anchor, monthly_counters, gauge_counters
    FROM subscription_records
    WHERE user_id = $1
"#;

/// Query counting the live rows behind a gauge, bound to the user id
fn live_count_query(feature: Feature) -> QuotaResult<&'static str> {
    match feature {
        Feature::ActiveJobs => Ok(
            "SELECT COUNT(*) FROM job_applications WHERE user_id = $1 AND archived_at IS NULL",
        ),
        other => Err(QuotaError::FeatureMismatch {
            feature: other,
            expected: MeterKind::Gauge,
            actual: other.meter(),
        }),
    }
}

/// Run `stage` under `limit`, then finish what it staged with `commit`.
///
/// Only `stage` is bounded. Dropping it on timeout rolls back whatever it
/// held open; once `commit` starts it is awaited to completion.
pub(crate) async fn commit_after_bounded<Tx, T, S, C, CF>(
    limit: Duration,
    user_id: UserId,
    stage: S,
    commit: C,
) -> QuotaResult<T>
where
    S: Future<Output = QuotaResult<(Tx, T)>>,
    C: FnOnce(Tx) -> CF,
    CF: Future<Output = QuotaResult<()>>,
{
    let (tx, value) = match tokio::time::timeout(limit, stage).await {
        Ok(staged) => staged?,
        Err(_) => {
            tracing::warn!(
                user_id = %user_id,
                timeout_ms = limit.as_millis() as u64,
                "Subscription transaction timed out, rolled back"
            );
            return Err(QuotaError::StoreUnavailable(format!(
                "transaction timed out after {:?}",
                limit
            )));
        }
    };
    commit(tx).await?;
    Ok(value)
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn run<T, F>(&self, user_id: UserId, live: Option<Feature>, f: F) -> QuotaResult<T>
    where
        T: Send,
        F: FnOnce(&mut SubscriptionRecord, &mut LedgerBuffer, u32) -> QuotaResult<T> + Send,
    {
        commit_after_bounded(
            self.timeout,
            user_id,
            self.stage(user_id, live, f),
            |tx: Transaction<'static, Postgres>| async move {
                tx.commit().await.map_err(QuotaError::from)
            },
        )
        .await
    }

    /// Lock, apply `f` and write, leaving the transaction open for commit
    async fn stage<T, F>(
        &self,
        user_id: UserId,
        live: Option<Feature>,
        f: F,
    ) -> QuotaResult<(Transaction<'static, Postgres>, T)>
    where
        T: Send,
        F: FnOnce(&mut SubscriptionRecord, &mut LedgerBuffer, u32) -> QuotaResult<T> + Send,
    {
        let mut tx = self.pool.begin().await?;

        // Surface lock contention as a database error instead of waiting out
        // the outer timeout
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = {}",
            self.timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        let row: Option<SubscriptionRow> =
            sqlx::query_as(&format!("{} FOR UPDATE", SELECT_RECORD))
                .bind(user_id.0)
                .fetch_optional(&mut *tx)
                .await?;

        let row = row.ok_or(QuotaError::SubscriptionNotFound(user_id))?;

        // Counted after the row lock, so acquires that commit alongside a new
        // resource are either visible here or still queued behind us
        let count = match live {
            Some(feature) => {
                let (count,): (i64,) = sqlx::query_as(live_count_query(feature)?)
                    .bind(user_id.0)
                    .fetch_one(&mut *tx)
                    .await?;
                u32::try_from(count.max(0)).unwrap_or(u32::MAX)
            }
            None => 0,
        };

        let (mut record, corrected) = load_record(row)?;
        let before = record.clone();
        let mut buffer = LedgerBuffer::new();

        let value = match f(&mut record, &mut buffer, count) {
            Ok(value) => value,
            Err(e) => {
                tx.rollback().await.ok();
                return Err(e);
            }
        };

        if corrected || record != before {
            let stored = SubscriptionRow::from_record(&record);
            sqlx::query(
                r#"
                UPDATE subscription_records
                SET tier = $2,
                    tier_expires_at = $3,
                    cycle_anchor = $4,
                    monthly_counters = $5,
                    gauge_counters = $6,
                    updated_at = NOW()
                WHERE user_id = $1
                "#,
            )
            .bind(stored.user_id)
            .bind(&stored.tier)
            .bind(stored.tier_expires_at)
            .bind(stored.cycle_anchor)
            .bind(&stored.monthly_counters)
            .bind(&stored.gauge_counters)
            .execute(&mut *tx)
            .await?;
        }

        for entry in buffer.into_entries() {
            let units = i32::try_from(entry.units).map_err(|_| {
                QuotaError::InvalidInput(format!("ledger units out of range: {}", entry.units))
            })?;
            sqlx::query(
                r#"
                INSERT INTO usage_ledger (
                    user_id, feature, operation, outcome, tier_at_time,
                    counter_value_after, units, reason, recorded_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9
                )
                "#,
            )
            .bind(entry.user_id.0)
            .bind(entry.feature.as_str())
            .bind(entry.operation.as_str())
            .bind(entry.outcome.as_str())
            .bind(entry.tier_at_time.as_str())
            .bind(entry.counter_value_after)
            .bind(units)
            .bind(entry.reason.as_deref())
            .bind(entry.recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        Ok((tx, value))
    }
}

impl SubscriptionStore for PgStore {
    async fn insert(&self, record: SubscriptionRecord) -> QuotaResult<()> {
        let stored = SubscriptionRow::from_record(&record);
        let result = sqlx::query(
            r#"
            INSERT INTO subscription_records (
                user_id, tier, tier_expires_at, cycle_anchor, monthly_counters, gauge_counters
            ) VALUES (
                $1, $2, $3, $4, $5, $6
            )
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(stored.user_id)
        .bind(&stored.tier)
        .bind(stored.tier_expires_at)
        .bind(stored.cycle_anchor)
        .bind(&stored.monthly_counters)
        .bind(&stored.gauge_counters)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QuotaError::AlreadyExists(record.user_id));
        }
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> QuotaResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(SELECT_RECORD)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(load_record(row)?.0)),
            None => Ok(None),
        }
    }

    async fn transact<T, F>(&self, user_id: UserId, f: F) -> QuotaResult<T>
    where
        T: Send,
        F: FnOnce(&mut SubscriptionRecord, &mut LedgerBuffer) -> QuotaResult<T> + Send,
    {
        self.run(user_id, None, |record, ledger, _| f(record, ledger))
            .await
    }

    async fn transact_live<T, F>(&self, user_id: UserId, feature: Feature, f: F) -> QuotaResult<T>
    where
        T: Send,
        F: FnOnce(&mut SubscriptionRecord, &mut LedgerBuffer, u32) -> QuotaResult<T> + Send,
    {
        self.run(user_id, Some(feature), f).await
    }

    async fn ledger_entries(&self, user_id: UserId) -> QuotaResult<Vec<UsageLedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT user_id, feature, operation, outcome, tier_at_time,
                   counter_value_after, units, reason, recorded_at
            FROM usage_ledger
            WHERE user_id = $1
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerRow::into_entry).collect()
    }

    async fn remap_tier(&self, legacy: &str, tier: Tier) -> QuotaResult<u64> {
        let result = sqlx::query(
            "UPDATE subscription_records SET tier = $1, updated_at = NOW() WHERE LOWER(tier) = LOWER($2)",
        )
        .bind(tier.as_str())
        .bind(legacy)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_users(&self) -> QuotaResult<Vec<UserId>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM subscription_records ORDER BY user_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| UserId(id)).collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    user_id: Uuid,
    feature: String,
    operation: String,
    outcome: String,
    tier_at_time: String,
    counter_value_after: i64,
    units: i32,
    reason: Option<String>,
    recorded_at: OffsetDateTime,
}

impl LedgerRow {
    fn into_entry(self) -> QuotaResult<UsageLedgerEntry> {
        Ok(UsageLedgerEntry {
            user_id: UserId(self.user_id),
            feature: self.feature.parse()?,
            operation: self.operation.parse()?,
            outcome: self.outcome.parse()?,
            // Entries are immutable, so rows written before a tier rename
            // keep the old identifier
            tier_at_time: self
                .tier_at_time
                .parse::<Tier>()
                .or_else(|_| Tier::from_legacy(&self.tier_at_time).ok_or(()))
                .map_err(|_| QuotaError::TierNotFound(self.tier_at_time.clone()))?,
            counter_value_after: self.counter_value_after,
            units: u32::try_from(self.units)
                .map_err(|_| QuotaError::Database(format!("negative ledger units: {}", self.units)))?,
            reason: self.reason,
            recorded_at: self.recorded_at,
        })
    }
}
