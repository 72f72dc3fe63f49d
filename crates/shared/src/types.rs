//! Common types used across QuotaGuard

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CatalogError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Tiers
// =============================================================================

/// Subscription tier
///
/// Ordered from lowest to highest. `Applicant` is the free tier every user
/// starts on and falls back to when a paid tier expires.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Applicant,
    Candidate,
    Executive,
}

impl Default for Tier {
    fn default() -> Self {
        Self::lowest()
    }
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Applicant, Tier::Candidate, Tier::Executive];
    pub const COUNT: usize = Self::ALL.len();

    /// The default tier for new and expired subscriptions
    pub const fn lowest() -> Self {
        Self::Applicant
    }

    /// Position in the upgrade order (higher = more capacity)
    pub const fn rank(&self) -> u8 {
        match self {
            Self::Applicant => 0,
            Self::Candidate => 1,
            Self::Executive => 2,
        }
    }

    pub(crate) const fn index(&self) -> usize {
        self.rank() as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applicant => "applicant",
            Self::Candidate => "candidate",
            Self::Executive => "executive",
        }
    }

    /// Resolve a retired tier identifier through [`LEGACY_TIER_MIGRATIONS`]
    pub fn from_legacy(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        LEGACY_TIER_MIGRATIONS
            .iter()
            .find(|(legacy, _)| *legacy == name)
            .map(|(_, tier)| *tier)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = CatalogError;

    /// Strict parse. Legacy identifiers are rejected here; they are remapped
    /// once by the tier migration, never matched ad hoc.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "applicant" => Ok(Self::Applicant),
            "candidate" => Ok(Self::Candidate),
            "executive" => Ok(Self::Executive),
            _ => Err(CatalogError::UnknownTier(s.to_string())),
        }
    }
}

/// Version of [`LEGACY_TIER_MIGRATIONS`]. Bump when an entry is added.
pub const LEGACY_TIER_MIGRATION_VERSION: u32 = 1;

/// Retired tier identifiers and the tier each one maps to
pub const LEGACY_TIER_MIGRATIONS: &[(&str, Tier)] = &[
    ("free", Tier::Applicant),
    ("starter", Tier::Applicant),
    ("professional", Tier::Candidate),
    ("pro", Tier::Candidate),
    ("premium", Tier::Executive),
    ("enterprise", Tier::Executive),
];

// =============================================================================
// Features
// =============================================================================

/// How a feature's consumption is metered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterKind {
    /// Counter that resets at every cycle boundary
    Monthly,
    /// Count of concurrently live resources
    Gauge,
}

impl std::fmt::Display for MeterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Gauge => write!(f, "gauge"),
        }
    }
}

/// A metered feature
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// AI resume optimization runs
    Optimizations,
    /// ATS compatibility report generation
    AtsReports,
    /// Job applications currently being tracked (not archived)
    ActiveJobs,
}

impl Feature {
    pub const ALL: [Feature; 3] = [Feature::Optimizations, Feature::AtsReports, Feature::ActiveJobs];
    pub const COUNT: usize = Self::ALL.len();

    pub const fn meter(&self) -> MeterKind {
        match self {
            Self::Optimizations | Self::AtsReports => MeterKind::Monthly,
            Self::ActiveJobs => MeterKind::Gauge,
        }
    }

    pub(crate) const fn index(&self) -> usize {
        match self {
            Self::Optimizations => 0,
            Self::AtsReports => 1,
            Self::ActiveJobs => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Optimizations => "optimizations",
            Self::AtsReports => "ats_reports",
            Self::ActiveJobs => "active_jobs",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "optimizations" => Ok(Self::Optimizations),
            "ats_reports" => Ok(Self::AtsReports),
            "active_jobs" => Ok(Self::ActiveJobs),
            _ => Err(CatalogError::UnknownFeature(s.to_string())),
        }
    }
}

// =============================================================================
// Limits
// =============================================================================

/// Per-tier limit for one feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "cap", rename_all = "snake_case")]
pub enum Limit {
    Unlimited,
    Blocked,
    Monthly(u32),
    Gauge(u32),
}

impl Limit {
    /// Numeric cap; `None` for unlimited
    pub fn cap(&self) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::Blocked => Some(0),
            Self::Monthly(n) | Self::Gauge(n) => Some(*n),
        }
    }

    /// Whether this limit may be attached to a feature with the given meter.
    /// `Unlimited` and `Blocked` fit either.
    pub fn fits(&self, meter: MeterKind) -> bool {
        match self {
            Self::Unlimited | Self::Blocked => true,
            Self::Monthly(_) => meter == MeterKind::Monthly,
            Self::Gauge(_) => meter == MeterKind::Gauge,
        }
    }

    /// Units left after `used`; `None` for unlimited
    pub fn remaining(&self, used: i64) -> Option<u32> {
        self.cap().map(|cap| {
            let left = i64::from(cap) - used.max(0);
            u32::try_from(left.max(0)).unwrap_or(0)
        })
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Blocked => write!(f, "blocked"),
            Self::Monthly(n) => write!(f, "monthly({})", n),
            Self::Gauge(n) => write!(f, "gauge({})", n),
        }
    }
}
