//! Quota error types
//!
//! Denials (`QuotaExhausted`, `FeatureBlocked`, gauge cap reached) are not
//! errors: they come back as a [`Decision`](crate::Decision). Everything in
//! [`QuotaError`] is either a programmer/config bug or an infrastructure
//! fault, and none of them ever yields an `allowed` outcome.

use quotaguard_shared::{CatalogError, Feature, MeterKind, Tier, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("Tier not found: {0}")]
    TierNotFound(String),

    #[error("Feature not found: {0}")]
    FeatureNotFound(String),

    #[error("Feature {feature} is metered as {actual}, not {expected}")]
    FeatureMismatch {
        feature: Feature,
        expected: MeterKind,
        actual: MeterKind,
    },

    #[error("Subscription not found for user {0}")]
    SubscriptionNotFound(UserId),

    #[error("Subscription already exists for user {0}")]
    AlreadyExists(UserId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid tier transition from {from} to {to}")]
    InvalidTransition { from: Tier, to: Tier },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl QuotaError {
    /// Transient fault; the caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Deploy/config bug that should never reach production
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::TierNotFound(_) | Self::FeatureNotFound(_) | Self::FeatureMismatch { .. }
        )
    }
}

impl From<CatalogError> for QuotaError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::UnknownTier(tier) => QuotaError::TierNotFound(tier),
            CatalogError::UnknownFeature(feature) => QuotaError::FeatureNotFound(feature),
            CatalogError::LimitKindMismatch {
                feature, meter, limit, ..
            } => QuotaError::InvalidInput(format!(
                "limit {} does not fit {} feature {}",
                limit, meter, feature
            )),
        }
    }
}

impl From<sqlx::Error> for QuotaError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                QuotaError::StoreUnavailable(err.to_string())
            }
            sqlx::Error::Database(ref db) if is_transient_sqlstate(db.code().as_deref()) => {
                QuotaError::StoreUnavailable(err.to_string())
            }
            other => QuotaError::Database(other.to_string()),
        }
    }
}

/// Lock timeouts, serialization failures, deadlocks and statement timeouts
fn is_transient_sqlstate(code: Option<&str>) -> bool {
    matches!(code, Some("40001" | "40P01" | "55P03" | "57014"))
}

pub type QuotaResult<T> = Result<T, QuotaError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_is_retryable() {
        assert!(QuotaError::StoreUnavailable("timeout".into()).is_retryable());
        assert!(!QuotaError::Database("decode".into()).is_retryable());
        assert!(!QuotaError::TierNotFound("gold".into()).is_retryable());
    }

    #[test]
    fn test_programmer_errors() {
        let mismatch = QuotaError::FeatureMismatch {
            feature: Feature::ActiveJobs,
            expected: MeterKind::Monthly,
            actual: MeterKind::Gauge,
        };
        assert!(mismatch.is_programmer_error());
        assert!(QuotaError::TierNotFound("gold".into()).is_programmer_error());
        assert!(!QuotaError::StoreUnavailable("x".into()).is_programmer_error());
    }

    #[test]
    fn test_pool_timeout_maps_to_store_unavailable() {
        let err: QuotaError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());
        let err: QuotaError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, QuotaError::Database(_)));
    }

    #[test]
    fn test_catalog_error_conversion() {
        let err: QuotaError = CatalogError::UnknownTier("free".into()).into();
        assert!(matches!(err, QuotaError::TierNotFound(t) if t == "free"));
    }
}
