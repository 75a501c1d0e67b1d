//! Reconciliation sweep
//!
//! The synchronous payment path can die between inserting a PROCESSING row
//! and settling it (hung gateway call, crashed instance, client disconnect).
//! The client cannot be trusted to retry safely, so this sweep is the
//! recovery path: transactions stuck PROCESSING past the timeout are failed
//! by compare-and-set. The timeout is far beyond any webhook delivery
//! window, so a late `payment.captured` finding the swept row is an
//! idempotent no-op rather than a status downgrade.

use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

/// Default age after which a PROCESSING transaction is considered abandoned
pub const DEFAULT_STALE_AFTER_MINUTES: i64 = 30;

/// Fail transactions stuck in PROCESSING past the cutoff.
/// Returns the number of rows swept.
pub async fn sweep_stale_transactions(pool: &PgPool, stale_after_minutes: i64) -> u64 {
    let swept: Vec<(Uuid, String)> = match sqlx::query_as(
        r#"
        UPDATE transactions
        SET status = 'FAILED',
            failure_reason = 'Gateway timeout: no result within the processing window',
            processed_at = NOW()
        WHERE status = 'PROCESSING'
          AND created_at < NOW() - interval '1 minute' * $1
        RETURNING id, reference
        "#,
    )
    .bind(stale_after_minutes)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to sweep stale transactions");
            return 0;
        }
    };

    for (id, reference) in &swept {
        info!(
            transaction_id = %id,
            reference = %reference,
            stale_after_minutes = stale_after_minutes,
            "Stale PROCESSING transaction failed by reconciliation sweep"
        );
    }

    swept.len() as u64
}

/// Cleanup old webhook audit rows (for maintenance job)
pub async fn cleanup_old_webhook_events(pool: &PgPool, retention_days: i32) {
    let result = sqlx::query(
        r#"
        DELETE FROM gateway_webhook_events
        WHERE received_at < NOW() - ($1::text || ' days')::INTERVAL
          AND processing_result IN ('success', 'error')
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match result {
        Ok(rows) => {
            if rows.rows_affected() > 0 {
                info!(
                    deleted = rows.rows_affected(),
                    retention_days = retention_days,
                    "Cleaned up old webhook audit entries"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to cleanup old webhook events");
        }
    }
}
