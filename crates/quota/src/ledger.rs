//! Usage ledger
//!
//! Append-only audit trail: one entry per quota decision, gauge release or
//! reconciliation. Entries are staged in a [`LedgerBuffer`] while the record
//! is locked and written by the store in the same transaction as the counter
//! change, so an entry exists if and only if its decision was committed.

use quotaguard_shared::{Feature, Tier, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::QuotaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    Allowed,
    Denied,
}

impl LedgerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
        }
    }
}

impl std::str::FromStr for LedgerOutcome {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(Self::Allowed),
            "denied" => Ok(Self::Denied),
            _ => Err(QuotaError::Database(format!("unknown ledger outcome: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOperation {
    Consume,
    Acquire,
    Release,
    Reconcile,
}

impl LedgerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consume => "consume",
            Self::Acquire => "acquire",
            Self::Release => "release",
            Self::Reconcile => "reconcile",
        }
    }
}

impl std::str::FromStr for LedgerOperation {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consume" => Ok(Self::Consume),
            "acquire" => Ok(Self::Acquire),
            "release" => Ok(Self::Release),
            "reconcile" => Ok(Self::Reconcile),
            _ => Err(QuotaError::Database(format!("unknown ledger operation: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLedgerEntry {
    pub user_id: UserId,
    pub feature: Feature,
    pub operation: LedgerOperation,
    pub outcome: LedgerOutcome,
    pub tier_at_time: Tier,
    pub counter_value_after: i64,
    pub units: u32,
    /// Machine-readable denial reason (`feature_blocked`, `quota_exhausted`, ...)
    pub reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Entries staged during one locked transaction
#[derive(Debug, Default)]
pub struct LedgerBuffer {
    entries: Vec<UsageLedgerEntry>,
}

impl LedgerBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: UsageLedgerEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn into_entries(self) -> Vec<UsageLedgerEntry> {
        self.entries
    }
}
