//! Subscription state machine
//!
//! Records move CREATED → ACTIVE → CANCELED; CANCELED is terminal for the
//! record and re-subscription creates a new row. Every transition is written
//! as a conditional update so the synchronous path, the webhook reconciler
//! and an explicit user cancellation can race without clobbering each other:
//! the second writer finds the target state already in place and no-ops.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use billforge_shared::{BillingReason, PlanInterval, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::history::{self, NewBillingHistory};

/// A billing plan
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub interval: String,
    pub interval_count: i32,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price_cents == 0
    }

    /// The billing window starting at `start`:
    /// end is always `start + interval * interval_count`.
    pub fn period_from(&self, start: OffsetDateTime) -> BillingResult<(OffsetDateTime, OffsetDateTime)> {
        let interval = PlanInterval::from_str(&self.interval)
            .map_err(|e| BillingError::Internal(e.to_string()))?;
        let count = u32::try_from(self.interval_count)
            .map_err(|_| BillingError::Internal("negative interval_count".to_string()))?;
        Ok((start, interval.advance(start, count)))
    }
}

/// A subscription record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub gateway_subscription_id: Option<String>,
    pub gateway_status: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    pub fn is_canceled(&self) -> bool {
        self.status == SubscriptionStatus::Canceled.as_str()
    }
}

/// What `activate_in_tx` settled on, for the billing-history row
#[derive(Debug, Clone)]
pub struct ActivationInfo {
    pub subscription_id: Uuid,
    pub plan_name: String,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, status, gateway_subscription_id, \
     gateway_status, current_period_start, current_period_end, canceled_at, metadata, \
     created_at, updated_at";

/// Activate a subscription as part of a successful payment settlement.
///
/// Runs inside the caller's transaction so the activation commits together
/// with the terminal transaction-status write. Resets the billing window to
/// `now .. now + interval` and mirrors it onto the owning user.
pub(crate) async fn activate_in_tx(
    tx: &mut PgTransaction<'_, Postgres>,
    subscription_id: Uuid,
    user_id: Uuid,
    now: OffsetDateTime,
) -> BillingResult<ActivationInfo> {
    let plan: Plan = sqlx::query_as(
        r#"
        SELECT p.id, p.name, p.price_cents, p.interval, p.interval_count, p.active, p.created_at
        FROM plans p
        JOIN subscriptions s ON s.plan_id = p.id
        WHERE s.id = $1 AND s.user_id = $2
        "#,
    )
    .bind(subscription_id)
    .bind(user_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

    let (period_start, period_end) = plan.period_from(now)?;

    // Cancellation is terminal: a canceled row is never re-activated in place
    let updated = sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = 'ACTIVE',
            current_period_start = $2,
            current_period_end = $3,
            updated_at = NOW()
        WHERE id = $1 AND status <> 'CANCELED'
        "#,
    )
    .bind(subscription_id)
    .bind(period_start)
    .bind(period_end)
    .execute(&mut **tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(BillingError::SubscriptionNotFound(format!(
            "{subscription_id} is canceled"
        )));
    }

    // Mirror the billing window onto the user projection
    sqlx::query(
        r#"
        UPDATE users
        SET subscription_status = 'ACTIVE',
            plan_id = $2,
            next_billing_date = $3,
            subscription_end_date = $3,
            invoice_usage = 0,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(plan.id)
    .bind(period_end)
    .execute(&mut **tx)
    .await?;

    Ok(ActivationInfo {
        subscription_id,
        plan_name: plan.name,
        period_start,
        period_end,
    })
}

/// Subscription management service
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            "SELECT id, name, price_cents, interval, interval_count, active, created_at
             FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))
    }

    /// The active free plan users are demoted onto, if one is configured
    pub async fn free_plan(&self) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(
            "SELECT id, name, price_cents, interval, interval_count, active, created_at
             FROM plans WHERE price_cents = 0 AND active LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    /// Create a CREATED subscription row for a plan, ahead of first payment
    pub async fn create_for_plan(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        gateway_subscription_id: Option<&str>,
    ) -> BillingResult<SubscriptionRecord> {
        let plan = self.get_plan(plan_id).await?;
        if !plan.active {
            return Err(BillingError::PlanNotFound(format!("{plan_id} is inactive")));
        }

        let inserted: Result<SubscriptionRecord, sqlx::Error> = sqlx::query_as(
            &format!(
                r#"
                INSERT INTO subscriptions (user_id, plan_id, status, gateway_subscription_id)
                VALUES ($1, $2, 'CREATED', $3)
                RETURNING {SUBSCRIPTION_COLUMNS}
                "#
            ),
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(gateway_subscription_id)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(record) => Ok(record),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                Err(BillingError::InvalidInput(
                    "user already has an open subscription".to_string(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The user's open (non-canceled) subscription, if any
    pub async fn get_for_user(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            &format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
                 WHERE user_id = $1 AND status <> 'CANCELED'"
            ),
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn find_by_gateway_id(
        &self,
        gateway_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            &format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
                 WHERE gateway_subscription_id = $1"
            ),
        )
        .bind(gateway_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Webhook `subscription.activated`: mark ACTIVE, record the gateway's status
    pub async fn mark_active_from_gateway(
        &self,
        gateway_subscription_id: &str,
        gateway_status: Option<&str>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            &format!(
                r#"
                UPDATE subscriptions
                SET status = 'ACTIVE', gateway_status = COALESCE($2, gateway_status), updated_at = NOW()
                WHERE gateway_subscription_id = $1 AND status <> 'CANCELED'
                RETURNING {SUBSCRIPTION_COLUMNS}
                "#
            ),
        )
        .bind(gateway_subscription_id)
        .bind(gateway_status)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref sub) = record {
            sqlx::query(
                "UPDATE users SET subscription_status = 'ACTIVE', updated_at = NOW() WHERE id = $1",
            )
            .bind(sub.user_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(record)
    }

    /// Webhook `subscription.updated`: merge gateway state, no local transition
    pub async fn merge_gateway_status(
        &self,
        gateway_subscription_id: &str,
        gateway_status: &str,
    ) -> BillingResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET gateway_status = $2,
                metadata = metadata || jsonb_build_object('gateway_status', $2::text),
                updated_at = NOW()
            WHERE gateway_subscription_id = $1
            "#,
        )
        .bind(gateway_subscription_id)
        .bind(gateway_status)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    /// User-initiated cancellation. Safe to race against the
    /// `subscription.cancelled` webhook: both drive to the same end state.
    pub async fn cancel_for_user(&self, user_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            &format!(
                r#"
                UPDATE subscriptions
                SET status = 'CANCELED', canceled_at = NOW(), updated_at = NOW()
                WHERE user_id = $1 AND status <> 'CANCELED'
                RETURNING {SUBSCRIPTION_COLUMNS}
                "#
            ),
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let record =
            record.ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        self.demote_user_to_free(user_id).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %record.id,
            "Subscription canceled by user"
        );

        Ok(record)
    }

    /// Gateway-driven cancellation (`subscription.cancelled` / `.completed`)
    pub async fn cancel_by_gateway_id(
        &self,
        gateway_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            &format!(
                r#"
                UPDATE subscriptions
                SET status = 'CANCELED', canceled_at = COALESCE(canceled_at, NOW()), updated_at = NOW()
                WHERE gateway_subscription_id = $1 AND status <> 'CANCELED'
                RETURNING {SUBSCRIPTION_COLUMNS}
                "#
            ),
        )
        .bind(gateway_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref sub) = record {
            self.demote_user_to_free(sub.user_id).await?;
            tracing::info!(
                user_id = %sub.user_id,
                subscription_id = %sub.id,
                gateway_subscription_id = %gateway_subscription_id,
                "Subscription canceled from gateway event"
            );
        }

        Ok(record)
    }

    /// Demote a user onto the free plan, clearing billing dates.
    /// No-op when no free plan is configured.
    async fn demote_user_to_free(&self, user_id: Uuid) -> BillingResult<()> {
        let free = match self.free_plan().await? {
            Some(plan) => plan,
            None => {
                tracing::warn!(user_id = %user_id, "No active free plan; skipping demotion");
                return Ok(());
            }
        };

        sqlx::query(
            r#"
            UPDATE users
            SET subscription_status = 'CANCELED',
                plan_id = $2,
                next_billing_date = NULL,
                subscription_end_date = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(free.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Plan switch that needs no real-time payment: target must be the free
    /// plan or cheaper than the current one. Paid upgrades go through the
    /// payment path instead.
    pub async fn change_plan(
        &self,
        user_id: Uuid,
        new_plan_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let new_plan = self.get_plan(new_plan_id).await?;
        if !new_plan.active {
            return Err(BillingError::PlanNotFound(format!("{new_plan_id} is inactive")));
        }

        let current = self.get_for_user(user_id).await?;

        if let Some(ref sub) = current {
            let current_plan = self.get_plan(sub.plan_id).await?;
            if new_plan.price_cents > current_plan.price_cents {
                return Err(BillingError::InvalidInput(
                    "paid upgrades require a subscription payment".to_string(),
                ));
            }
            // Cancellation is terminal per record; the switch creates a new row
            sqlx::query(
                "UPDATE subscriptions
                 SET status = 'CANCELED', canceled_at = NOW(), updated_at = NOW()
                 WHERE id = $1 AND status <> 'CANCELED'",
            )
            .bind(sub.id)
            .execute(&self.pool)
            .await?;
        } else if new_plan.price_cents > 0 {
            return Err(BillingError::InvalidInput(
                "paid plans require a subscription payment".to_string(),
            ));
        }

        if new_plan.is_free() {
            self.demote_user_to_free(user_id).await?;
            return Ok(None);
        }

        // Cheaper paid plan: open a new subscription billed from now
        let now = OffsetDateTime::now_utc();
        let (period_start, period_end) = new_plan.period_from(now)?;

        let record: SubscriptionRecord = sqlx::query_as(
            &format!(
                r#"
                INSERT INTO subscriptions
                    (user_id, plan_id, status, current_period_start, current_period_end)
                VALUES ($1, $2, 'ACTIVE', $3, $4)
                RETURNING {SUBSCRIPTION_COLUMNS}
                "#
            ),
        )
        .bind(user_id)
        .bind(new_plan.id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE users
            SET subscription_status = 'ACTIVE',
                plan_id = $2,
                next_billing_date = $3,
                subscription_end_date = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(new_plan.id)
        .bind(period_end)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            plan = %new_plan.name,
            "Plan changed without payment"
        );

        Ok(Some(record))
    }

    /// Webhook `subscription.charged`: one renewal exactly once per gateway
    /// payment id. The billing-history insert is the dedupe gate; period
    /// advancement and usage reset ride in the same transaction and are
    /// skipped entirely when the insert loses to an earlier delivery.
    pub async fn renew_from_charge(
        &self,
        gateway_subscription_id: &str,
        gateway_payment_id: &str,
        amount_cents: Option<i64>,
        payment_method: &str,
    ) -> BillingResult<bool> {
        let sub = match self.find_by_gateway_id(gateway_subscription_id).await? {
            Some(sub) if !sub.is_canceled() => sub,
            Some(_) | None => {
                tracing::info!(
                    gateway_subscription_id = %gateway_subscription_id,
                    "subscription.charged for unknown or canceled subscription; ignoring"
                );
                return Ok(false);
            }
        };

        let plan = self.get_plan(sub.plan_id).await?;
        let now = OffsetDateTime::now_utc();
        // New window starts where the paid-through window ends, never in the past
        let start = sub
            .current_period_end
            .filter(|end| *end > now)
            .unwrap_or(now);
        let (period_start, period_end) = plan.period_from(start)?;

        let mut tx = self.pool.begin().await?;

        let inserted = history::insert_in_tx(
            &mut tx,
            NewBillingHistory {
                user_id: sub.user_id,
                subscription_id: Some(sub.id),
                transaction_id: None,
                gateway_payment_id: Some(gateway_payment_id.to_string()),
                amount_cents: amount_cents.unwrap_or(plan.price_cents),
                plan_name: plan.name.clone(),
                billing_reason: BillingReason::SubscriptionRenewal,
                period_start: Some(period_start),
                period_end: Some(period_end),
                payment_method: payment_method.to_string(),
            },
        )
        .await?;

        if !inserted {
            // Duplicate delivery of the same charge; nothing more to do
            tx.rollback().await?;
            tracing::info!(
                gateway_payment_id = %gateway_payment_id,
                "Renewal already recorded; skipping"
            );
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET current_period_start = $2, current_period_end = $3, updated_at = NOW()
            WHERE id = $1 AND status <> 'CANCELED'
            "#,
        )
        .bind(sub.id)
        .bind(period_start)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        // Advance the user's billing date by one cycle and reset the monthly counter
        sqlx::query(
            r#"
            UPDATE users
            SET next_billing_date = $2,
                subscription_end_date = $2,
                invoice_usage = 0,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(sub.user_id)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %sub.user_id,
            subscription_id = %sub.id,
            gateway_payment_id = %gateway_payment_id,
            period_end = %period_end,
            "Recurring charge reconciled"
        );

        Ok(true)
    }
}
