//! In-memory store (for development and tests without Postgres)
//!
//! Each user gets their own `tokio::sync::Mutex` slot, so transactions for one
//! user are serialized while different users proceed in parallel. Every wait
//! on a slot, reads included, is bounded by the lock timeout.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use quotaguard_shared::{Feature, Tier, UserId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{load_record, SubscriptionRow, SubscriptionStore};
use crate::error::{QuotaError, QuotaResult};
use crate::ledger::{LedgerBuffer, UsageLedgerEntry};
use crate::record::SubscriptionRecord;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

struct UserSlot {
    row: SubscriptionRow,
    ledger: Vec<UsageLedgerEntry>,
    /// Stand-in for the resource tables a database backend would count
    live: BTreeMap<Feature, u32>,
}

impl UserSlot {
    fn new(row: SubscriptionRow) -> Self {
        Self {
            row,
            ledger: Vec::new(),
            live: BTreeMap::new(),
        }
    }
}

pub struct InMemoryStore {
    slots: RwLock<HashMap<UserId, Arc<Mutex<UserSlot>>>>,
    lock_timeout: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Waiting longer than `lock_timeout` for a user's slot fails with
    /// `StoreUnavailable`
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// Load a row as it would come out of the database, legacy identifiers
    /// and all. Overwrites any existing row for the same user.
    pub async fn insert_row(&self, row: SubscriptionRow) {
        let user_id = UserId(row.user_id);
        let slot = Arc::new(Mutex::new(UserSlot::new(row)));
        self.slots.write().await.insert(user_id, slot);
    }

    /// Raw stored row, bypassing decoding
    pub async fn row(&self, user_id: UserId) -> QuotaResult<Option<SubscriptionRow>> {
        let Some(slot) = self.slot(user_id).await else {
            return Ok(None);
        };
        let guard = self.lock(user_id, slot).await?;
        Ok(Some(guard.row.clone()))
    }

    /// Record how many live resources back `feature` for this user, as the
    /// owning application would by inserting or archiving rows
    pub async fn set_live_count(
        &self,
        user_id: UserId,
        feature: Feature,
        count: u32,
    ) -> QuotaResult<()> {
        let slot = self
            .slot(user_id)
            .await
            .ok_or(QuotaError::SubscriptionNotFound(user_id))?;
        let mut guard = self.lock(user_id, slot).await?;
        guard.live.insert(feature, count);
        Ok(())
    }

    async fn slot(&self, user_id: UserId) -> Option<Arc<Mutex<UserSlot>>> {
        self.slots.read().await.get(&user_id).cloned()
    }

    async fn lock(
        &self,
        user_id: UserId,
        slot: Arc<Mutex<UserSlot>>,
    ) -> QuotaResult<OwnedMutexGuard<UserSlot>> {
        tokio::time::timeout(self.lock_timeout, slot.lock_owned())
            .await
            .map_err(|_| {
                tracing::warn!(user_id = %user_id, "Timed out waiting for subscription lock");
                QuotaError::StoreUnavailable(format!(
                    "timed out after {:?} waiting for subscription lock",
                    self.lock_timeout
                ))
            })
    }

    async fn locked<T, F>(&self, user_id: UserId, live: Option<Feature>, f: F) -> QuotaResult<T>
    where
        F: FnOnce(&mut SubscriptionRecord, &mut LedgerBuffer, u32) -> QuotaResult<T>,
    {
        let slot = self
            .slot(user_id)
            .await
            .ok_or(QuotaError::SubscriptionNotFound(user_id))?;
        let mut guard = self.lock(user_id, slot).await?;

        let (mut record, _) = load_record(guard.row.clone())?;
        let mut buffer = LedgerBuffer::new();
        let count = live
            .and_then(|feature| guard.live.get(&feature).copied())
            .unwrap_or(0);

        // Nothing below awaits, so the closure and the write-back cannot be
        // interrupted halfway.
        let value = f(&mut record, &mut buffer, count)?;

        guard.row = SubscriptionRow::from_record(&record);
        guard.ledger.extend(buffer.into_entries());
        Ok(value)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionStore for InMemoryStore {
    async fn insert(&self, record: SubscriptionRecord) -> QuotaResult<()> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(&record.user_id) {
            return Err(QuotaError::AlreadyExists(record.user_id));
        }
        slots.insert(
            record.user_id,
            Arc::new(Mutex::new(UserSlot::new(SubscriptionRow::from_record(&record)))),
        );
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> QuotaResult<Option<SubscriptionRecord>> {
        match self.row(user_id).await? {
            Some(row) => Ok(Some(load_record(row)?.0)),
            None => Ok(None),
        }
    }

    async fn transact<T, F>(&self, user_id: UserId, f: F) -> QuotaResult<T>
    where
        T: Send,
        F: FnOnce(&mut SubscriptionRecord, &mut LedgerBuffer) -> QuotaResult<T> + Send,
    {
        self.locked(user_id, None, |record, ledger, _| f(record, ledger))
            .await
    }

    async fn transact_live<T, F>(&self, user_id: UserId, feature: Feature, f: F) -> QuotaResult<T>
    where
        T: Send,
        F: FnOnce(&mut SubscriptionRecord, &mut LedgerBuffer, u32) -> QuotaResult<T> + Send,
    {
        self.locked(user_id, Some(feature), f).await
    }

    async fn ledger_entries(&self, user_id: UserId) -> QuotaResult<Vec<UsageLedgerEntry>> {
        let slot = self
            .slot(user_id)
            .await
            .ok_or(QuotaError::SubscriptionNotFound(user_id))?;
        let guard = self.lock(user_id, slot).await?;
        Ok(guard.ledger.clone())
    }

    async fn remap_tier(&self, legacy: &str, tier: Tier) -> QuotaResult<u64> {
        let legacy = legacy.to_lowercase();
        let slots: Vec<(UserId, Arc<Mutex<UserSlot>>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(user_id, slot)| (*user_id, Arc::clone(slot)))
            .collect();

        let mut changed = 0;
        for (user_id, slot) in slots {
            let mut guard = self.lock(user_id, slot).await?;
            if guard.row.tier.to_lowercase() == legacy {
                guard.row.tier = tier.to_string();
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn list_users(&self) -> QuotaResult<Vec<UserId>> {
        let mut users: Vec<UserId> = self.slots.read().await.keys().copied().collect();
        users.sort();
        Ok(users)
    }
}
