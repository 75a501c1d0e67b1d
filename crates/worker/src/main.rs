//! billforge-worker entry point
//!
//! Background maintenance for the billing core: the stale-transaction
//! reconciliation sweep and webhook-audit retention.

use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

mod stale_transactions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let stale_after_minutes: i64 = std::env::var("STALE_TRANSACTION_MINUTES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(stale_transactions::DEFAULT_STALE_AFTER_MINUTES);

    let retention_days: i32 = std::env::var("WEBHOOK_EVENT_RETENTION_DAYS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(90);

    let pool = Arc::new(billforge_shared::create_pool(&database_url).await?);

    tracing::info!(
        stale_after_minutes = stale_after_minutes,
        retention_days = retention_days,
        "billforge-worker starting"
    );

    let scheduler = JobScheduler::new().await?;

    // Reconciliation sweep every 5 minutes
    let sweep_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
            let pool = sweep_pool.clone();
            Box::pin(async move {
                let swept =
                    stale_transactions::sweep_stale_transactions(&pool, stale_after_minutes).await;
                if swept > 0 {
                    tracing::info!(swept = swept, "Reconciliation sweep completed");
                }
            })
        })?)
        .await?;

    // Webhook audit retention, daily
    let cleanup_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _lock| {
            let pool = cleanup_pool.clone();
            Box::pin(async move {
                stale_transactions::cleanup_old_webhook_events(&pool, retention_days).await;
            })
        })?)
        .await?;

    scheduler.start().await?;

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    tracing::info!("billforge-worker shutting down");

    Ok(())
}
