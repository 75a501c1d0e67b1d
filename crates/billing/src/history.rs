//! Billing history
//!
//! Append-only audit trail of completed billing events, one row per
//! successful charge. The partial unique indexes on `gateway_payment_id` and
//! `transaction_id` are the dedupe gate: whichever observer of a charge
//! (synchronous path or webhook) inserts first wins, later inserts are
//! swallowed by `ON CONFLICT DO NOTHING` and reported as not-written so
//! callers can skip dependent side effects.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use time::OffsetDateTime;
use uuid::Uuid;

use billforge_shared::BillingReason;

use crate::error::BillingResult;
use crate::reference;

/// A completed billing event
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingHistoryRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub gateway_payment_id: Option<String>,
    pub amount_cents: i64,
    pub status: String,
    pub plan_name: String,
    pub billing_reason: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub paid_at: OffsetDateTime,
    pub invoice_number: String,
    pub payment_method: String,
    pub created_at: OffsetDateTime,
}

/// Input for a new billing-history row
#[derive(Debug, Clone)]
pub struct NewBillingHistory {
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub transaction_id: Option<Uuid>,
    pub gateway_payment_id: Option<String>,
    pub amount_cents: i64,
    pub plan_name: String,
    pub billing_reason: BillingReason,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub payment_method: String,
}

/// Insert a billing-history row inside the caller's transaction.
///
/// Returns whether a row was actually written; false means the charge was
/// already recorded by an earlier observer.
pub(crate) async fn insert_in_tx(
    tx: &mut PgTransaction<'_, Postgres>,
    new: NewBillingHistory,
) -> BillingResult<bool> {
    let invoice_number = reference::invoice_number(OffsetDateTime::now_utc());

    let result = sqlx::query(
        r#"
        INSERT INTO billing_history (
            user_id, subscription_id, transaction_id, gateway_payment_id,
            amount_cents, status, plan_name, billing_reason,
            period_start, period_end, paid_at, invoice_number, payment_method
        )
        VALUES ($1, $2, $3, $4, $5, 'PAID', $6, $7, $8, $9, NOW(), $10, $11)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(new.user_id)
    .bind(new.subscription_id)
    .bind(new.transaction_id)
    .bind(&new.gateway_payment_id)
    .bind(new.amount_cents)
    .bind(&new.plan_name)
    .bind(new.billing_reason.as_str())
    .bind(new.period_start)
    .bind(new.period_end)
    .bind(&invoice_number)
    .bind(&new.payment_method)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Read-side service over the billing history
pub struct BillingHistoryService {
    pool: PgPool,
}

impl BillingHistoryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a billing event outside any larger unit of work
    pub async fn record(&self, new: NewBillingHistory) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_in_tx(&mut tx, new).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Chronological billing history for a user, newest first
    pub async fn get_billing_history(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<BillingHistoryRecord>> {
        let records: Vec<BillingHistoryRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, subscription_id, transaction_id, gateway_payment_id,
                   amount_cents, status, plan_name, billing_reason,
                   period_start, period_end, paid_at, invoice_number, payment_method,
                   created_at
            FROM billing_history
            WHERE user_id = $1
            ORDER BY paid_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
