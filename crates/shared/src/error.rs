//! Error types for tier and feature identifiers

use thiserror::Error;

use crate::types::{Feature, Limit, MeterKind, Tier};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Limit {limit} on tier {tier} does not fit {meter} feature {feature}")]
    LimitKindMismatch {
        tier: Tier,
        feature: Feature,
        meter: MeterKind,
        limit: Limit,
    },
}
