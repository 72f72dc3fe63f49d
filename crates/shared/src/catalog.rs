//! Tier catalog
//!
//! Immutable table of per-tier, per-feature limits. Every tier carries a limit
//! for every feature; a feature a tier does not offer is `Blocked`, never
//! absent.
//!
//! | Tier      | optimizations | ats_reports | active_jobs |
//! |-----------|---------------|-------------|-------------|
//! | applicant | 10 / cycle    | blocked     | 10 live     |
//! | candidate | 50 / cycle    | 20 / cycle  | 50 live     |
//! | executive | unlimited     | 100 / cycle | unlimited   |

use crate::error::CatalogError;
use crate::types::{Feature, Limit, Tier};

/// Bump whenever a limit in [`TierCatalog::standard`] changes
pub const CATALOG_VERSION: u32 = 3;

type LimitTable = [[Limit; Feature::COUNT]; Tier::COUNT];

/// Rows follow `Tier::ALL`, columns follow `Feature::ALL`
const STANDARD_LIMITS: LimitTable = [
    // applicant
    [Limit::Monthly(10), Limit::Blocked, Limit::Gauge(10)],
    // candidate
    [Limit::Monthly(50), Limit::Monthly(20), Limit::Gauge(50)],
    // executive
    [Limit::Unlimited, Limit::Monthly(100), Limit::Unlimited],
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierCatalog {
    version: u32,
    limits: LimitTable,
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl TierCatalog {
    /// The compiled-in catalog
    pub const fn standard() -> Self {
        Self {
            version: CATALOG_VERSION,
            limits: STANDARD_LIMITS,
        }
    }

    /// Build a catalog from an explicit table, rejecting any limit whose
    /// kind does not match its feature's meter
    pub fn from_table(version: u32, limits: LimitTable) -> Result<Self, CatalogError> {
        let catalog = Self { version, limits };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn limit_for(&self, tier: Tier, feature: Feature) -> Limit {
        self.limits[tier.index()][feature.index()]
    }

    pub fn all_features(&self) -> &'static [Feature] {
        &Feature::ALL
    }

    /// Check the table at startup
    pub fn validate(&self) -> Result<(), CatalogError> {
        for tier in Tier::ALL {
            for feature in Feature::ALL {
                let limit = self.limit_for(tier, feature);
                if !limit.fits(feature.meter()) {
                    return Err(CatalogError::LimitKindMismatch {
                        tier,
                        feature,
                        meter: feature.meter(),
                        limit,
                    });
                }
            }
        }
        Ok(())
    }
}
