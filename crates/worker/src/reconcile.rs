//! Active job gauge reconciliation
//!
//! Snaps each user's `active_jobs` gauge to the number of live (unarchived)
//! job applications. Catches slots leaked by deletion paths that never
//! released. The count is taken by the store while the subscription record is
//! locked, so an acquire that lands mid-run is never overwritten.

use std::time::Duration;

use quotaguard_quota::{QuotaError, QuotaResult, QuotaService, ReconcileOutcome, SubscriptionStore};
use quotaguard_shared::{Feature, UserId};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const MAX_RETRIES: usize = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub drifted: usize,
    pub failed: usize,
}

/// Reconcile one user's gauge, retrying if the store is briefly unavailable
async fn reconcile_user<S: SubscriptionStore>(
    service: &QuotaService<S>,
    user_id: UserId,
) -> QuotaResult<ReconcileOutcome> {
    let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
        .max_delay(RETRY_MAX_DELAY)
        .take(MAX_RETRIES)
        .map(jitter);

    Retry::spawn(retry_strategy, || async move {
        let result = service.reconcile_live(user_id, Feature::ActiveJobs).await;
        match &result {
            Err(e) if e.is_retryable() => {
                tracing::debug!(user_id = %user_id, error = %e, "Store unavailable - will retry");
                Err(result)
            }
            _ => Ok(result),
        }
    })
    .await
    .unwrap_or_else(|e| e)
}

/// Reconcile every user with a record. Per-user failures are logged and
/// counted; one bad record does not stop the run.
pub async fn reconcile_all<S: SubscriptionStore>(
    service: &QuotaService<S>,
) -> QuotaResult<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for user_id in service.list_users().await? {
        report.checked += 1;
        match reconcile_user(service, user_id).await {
            Ok(outcome) if outcome.drifted() => report.drifted += 1,
            Ok(_) => {}
            Err(QuotaError::SubscriptionNotFound(_)) => {
                tracing::debug!(user_id = %user_id, "Record removed before reconcile, skipping");
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(user_id = %user_id, error = %e, "Failed to reconcile active jobs");
            }
        }
    }

    Ok(report)
}

pub async fn run<S: SubscriptionStore>(service: &QuotaService<S>) -> anyhow::Result<ReconcileReport> {
    let report = reconcile_all(service).await?;

    if report.drifted > 0 || report.failed > 0 {
        tracing::warn!(
            checked = report.checked,
            drifted = report.drifted,
            failed = report.failed,
            "Active job reconciliation finished with corrections"
        );
    } else {
        tracing::info!(checked = report.checked, "Active job reconciliation finished");
    }
    Ok(report)
}
