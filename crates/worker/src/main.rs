//! QuotaGuard background worker
//!
//! Applies pending schema and legacy tier migrations at startup, then keeps
//! active job gauges honest on a cron schedule.

mod config;
mod reconcile;

use std::sync::Arc;

use anyhow::Context;
use quotaguard_quota::{PgStore, QuotaService, SystemClock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;

    let pool = quotaguard_shared::create_pool(&config.database_url, config.pool)
        .await
        .context("Failed to connect to database")?;
    quotaguard_shared::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let store = Arc::new(PgStore::new(pool.clone(), config.quota.store_timeout));
    let service = Arc::new(QuotaService::new(store, &config.quota, Arc::new(SystemClock)));

    let migrated = service
        .migrate_legacy_tiers()
        .await
        .context("Failed to migrate legacy tier identifiers")?;
    tracing::info!(migrated, "Startup migrations complete");

    let mut scheduler = JobScheduler::new().await?;

    let job_service = Arc::clone(&service);
    let job = Job::new_async(config.reconcile_cron.as_str(), move |_id, _scheduler| {
        let service = Arc::clone(&job_service);
        Box::pin(async move {
            if let Err(e) = reconcile::run(&service).await {
                tracing::error!(error = %e, "Active job reconciliation failed");
            }
        })
    })
    .with_context(|| format!("Invalid RECONCILE_CRON '{}'", config.reconcile_cron))?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(schedule = %config.reconcile_cron, "Worker started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    scheduler.shutdown().await?;
    pool.close().await;

    Ok(())
}
