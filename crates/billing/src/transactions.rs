//! Transaction ledger and the synchronous payment path
//!
//! Every money-movement attempt gets a ledger row at PROCESSING before the
//! gateway is called, and ends at exactly one terminal status. Settlement —
//! the terminal-status write plus the money side effects it earns — is a
//! single database transaction gated by a compare-and-set on the PROCESSING
//! status. The webhook reconciler settles through the same routines, so
//! whichever path resolves first applies the side effects exactly once and
//! the loser finds a terminal row and backs off.

use serde_json::json;
use sqlx::PgPool;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use billforge_shared::{BillingReason, PaymentMethodKind, TransactionStatus, TransactionType};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeRequest, PaymentGateway};
use crate::history::{self, NewBillingHistory};
use crate::reference;
use crate::subscriptions;
use crate::wallet;

/// A ledger row
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub reference: String,
    pub tx_type: String,
    pub amount_cents: i64,
    pub status: String,
    pub payment_method: String,
    pub description: String,
    pub failure_reason: Option<String>,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub subscription_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub processed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl TransactionRecord {
    pub fn is_success(&self) -> bool {
        self.status == TransactionStatus::Success.as_str()
    }

    fn tx_type(&self) -> BillingResult<TransactionType> {
        TransactionType::from_str(&self.tx_type).map_err(|e| BillingError::Internal(e.to_string()))
    }
}

/// Input to the synchronous payment path
#[derive(Debug, Clone)]
pub struct ProcessPaymentInput {
    pub user_id: Uuid,
    pub amount_cents: i64,
    pub payment_method_id: Uuid,
    pub tx_type: TransactionType,
    pub description: String,
    pub subscription_id: Option<Uuid>,
}

/// Reject malformed input before anything is written.
pub fn validate_input(input: &ProcessPaymentInput) -> BillingResult<()> {
    if input.amount_cents <= 0 {
        return Err(BillingError::InvalidAmount(format!(
            "amount must be positive, got {}",
            input.amount_cents
        )));
    }
    if input.tx_type == TransactionType::SubscriptionPayment && input.subscription_id.is_none() {
        return Err(BillingError::InvalidInput(
            "subscription payments require a subscription id".to_string(),
        ));
    }
    Ok(())
}

/// Point-lookup key for a transaction
#[derive(Debug, Clone, Copy)]
pub enum TransactionLookup<'a> {
    Id(Uuid),
    Reference(&'a str),
}

/// Outcome of a settlement attempt
#[derive(Debug)]
pub enum Settlement {
    /// This call performed the terminal transition and its side effects
    Applied(TransactionRecord),
    /// Someone else already settled the row; no mutation happened here
    AlreadyTerminal(TransactionRecord),
    /// No such transaction
    NotFound,
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentMethodRow {
    id: Uuid,
    kind: String,
    label: String,
    active: bool,
}

const TX_COLUMNS: &str = "id, user_id, reference, tx_type, amount_cents, status, payment_method, \
     description, failure_reason, gateway_order_id, gateway_payment_id, subscription_id, \
     metadata, processed_at, created_at";

/// Ledger service and synchronous payment processor
pub struct TransactionService {
    gateway: PaymentGateway,
    pool: PgPool,
}

impl TransactionService {
    pub fn new(gateway: PaymentGateway, pool: PgPool) -> Self {
        Self { gateway, pool }
    }

    /// Process a client-initiated payment end to end.
    ///
    /// Validation and payment-method resolution reject before any write; once
    /// the PROCESSING row exists, every exit from this function leaves it at
    /// a terminal status, including gateway errors and settlement failures.
    pub async fn process_payment(
        &self,
        input: ProcessPaymentInput,
    ) -> BillingResult<TransactionRecord> {
        validate_input(&input)?;

        let method: PaymentMethodRow = sqlx::query_as(
            "SELECT id, kind, label, active FROM payment_methods WHERE id = $1 AND user_id = $2",
        )
        .bind(input.payment_method_id)
        .bind(input.user_id)
        .fetch_optional(&self.pool)
        .await?
        .filter(|m: &PaymentMethodRow| m.active)
        .ok_or_else(|| BillingError::PaymentMethodNotFound(input.payment_method_id.to_string()))?;

        let method_kind = PaymentMethodKind::from_str(&method.kind)
            .map_err(|e| BillingError::Internal(e.to_string()))?;

        if let Some(subscription_id) = input.subscription_id {
            let owned: Option<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM subscriptions
                 WHERE id = $1 AND user_id = $2 AND status <> 'CANCELED'",
            )
            .bind(subscription_id)
            .bind(input.user_id)
            .fetch_optional(&self.pool)
            .await?;
            if owned.is_none() {
                return Err(BillingError::SubscriptionNotFound(subscription_id.to_string()));
            }
        }

        let now = OffsetDateTime::now_utc();
        let tx_reference = reference::transaction_reference(now);
        let metadata = json!({
            "payment_method_id": input.payment_method_id,
            "subscription_id": input.subscription_id,
        });

        let record: TransactionRecord = sqlx::query_as(&format!(
            r#"
            INSERT INTO transactions
                (user_id, reference, tx_type, amount_cents, status, payment_method,
                 description, subscription_id, metadata)
            VALUES ($1, $2, $3, $4, 'PROCESSING', $5, $6, $7, $8)
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(input.user_id)
        .bind(&tx_reference)
        .bind(input.tx_type.as_str())
        .bind(input.amount_cents)
        .bind(&method.label)
        .bind(&input.description)
        .bind(input.subscription_id)
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            user_id = %input.user_id,
            reference = %tx_reference,
            tx_type = %input.tx_type,
            amount_cents = input.amount_cents,
            "Transaction created, charging gateway"
        );

        let charge = ChargeRequest {
            method_kind,
            amount_cents: input.amount_cents,
            reference: &tx_reference,
        };

        let outcome = match self.gateway.attempt_charge(&charge).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The ledger must record what is known even on exceptional paths
                self.force_fail(&tx_reference, "Payment gateway unavailable", Some(method.id))
                    .await;
                return Err(e);
            }
        };

        let settlement = if outcome.success {
            self.settle_success(
                &tx_reference,
                outcome.gateway_payment_id.as_deref(),
                outcome.gateway_order_id.as_deref(),
                Some(method.id),
            )
            .await
        } else {
            self.settle_failure(
                &tx_reference,
                outcome
                    .failure_reason
                    .as_deref()
                    .unwrap_or("Payment declined"),
                outcome.gateway_payment_id.as_deref(),
                Some(method.id),
            )
            .await
        };

        let settlement = match settlement {
            Ok(settlement) => settlement,
            Err(e) => {
                tracing::error!(
                    reference = %tx_reference,
                    error = %e,
                    "Settlement failed after charge attempt; forcing FAILED"
                );
                self.force_fail(&tx_reference, "Settlement failed", Some(method.id))
                    .await;
                return Err(e);
            }
        };

        match settlement {
            Settlement::Applied(record) | Settlement::AlreadyTerminal(record) => Ok(record),
            Settlement::NotFound => Err(BillingError::Internal(format!(
                "transaction {} vanished during settlement",
                record.reference
            ))),
        }
    }

    /// Transition a PROCESSING transaction to SUCCESS and apply its money
    /// side effects in one database transaction. The status CAS decides the
    /// single winner between the synchronous path and the webhook path.
    pub async fn settle_success(
        &self,
        tx_reference: &str,
        gateway_payment_id: Option<&str>,
        gateway_order_id: Option<&str>,
        touched_method: Option<Uuid>,
    ) -> BillingResult<Settlement> {
        let mut tx = self.pool.begin().await?;

        let claimed: Option<TransactionRecord> = sqlx::query_as(&format!(
            r#"
            UPDATE transactions
            SET status = 'SUCCESS',
                processed_at = NOW(),
                gateway_payment_id = COALESCE($2, gateway_payment_id),
                gateway_order_id = COALESCE($3, gateway_order_id)
            WHERE reference = $1 AND status = 'PROCESSING'
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(tx_reference)
        .bind(gateway_payment_id)
        .bind(gateway_order_id)
        .fetch_optional(&mut *tx)
        .await?;

        let record = match claimed {
            Some(record) => record,
            None => {
                tx.rollback().await?;
                return self.existing_settlement(tx_reference).await;
            }
        };

        match record.tx_type()? {
            TransactionType::WalletTopup => {
                wallet::credit_in_tx(&mut tx, record.user_id, record.amount_cents).await?;
            }
            TransactionType::SubscriptionPayment => {
                let subscription_id = record.subscription_id.ok_or_else(|| {
                    BillingError::Internal(format!(
                        "subscription payment {} has no subscription id",
                        record.reference
                    ))
                })?;
                let activation = subscriptions::activate_in_tx(
                    &mut tx,
                    subscription_id,
                    record.user_id,
                    OffsetDateTime::now_utc(),
                )
                .await?;
                history::insert_in_tx(
                    &mut tx,
                    NewBillingHistory {
                        user_id: record.user_id,
                        subscription_id: Some(subscription_id),
                        transaction_id: Some(record.id),
                        gateway_payment_id: record.gateway_payment_id.clone(),
                        amount_cents: record.amount_cents,
                        plan_name: activation.plan_name,
                        billing_reason: BillingReason::SubscriptionPayment,
                        period_start: Some(activation.period_start),
                        period_end: Some(activation.period_end),
                        payment_method: record.payment_method.clone(),
                    },
                )
                .await?;
            }
        }

        if let Some(method_id) = touched_method {
            sqlx::query("UPDATE payment_methods SET last_used_at = NOW() WHERE id = $1")
                .bind(method_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::info!(
            reference = %tx_reference,
            user_id = %record.user_id,
            "Transaction settled SUCCESS"
        );

        Ok(Settlement::Applied(record))
    }

    /// Transition a PROCESSING transaction to FAILED with a reason.
    pub async fn settle_failure(
        &self,
        tx_reference: &str,
        reason: &str,
        gateway_payment_id: Option<&str>,
        touched_method: Option<Uuid>,
    ) -> BillingResult<Settlement> {
        let mut tx = self.pool.begin().await?;

        let claimed: Option<TransactionRecord> = sqlx::query_as(&format!(
            r#"
            UPDATE transactions
            SET status = 'FAILED',
                processed_at = NOW(),
                failure_reason = $2,
                gateway_payment_id = COALESCE($3, gateway_payment_id)
            WHERE reference = $1 AND status = 'PROCESSING'
            RETURNING {TX_COLUMNS}
            "#
        ))
        .bind(tx_reference)
        .bind(reason)
        .bind(gateway_payment_id)
        .fetch_optional(&mut *tx)
        .await?;

        let record = match claimed {
            Some(record) => record,
            None => {
                tx.rollback().await?;
                return self.existing_settlement(tx_reference).await;
            }
        };

        if let Some(method_id) = touched_method {
            sqlx::query("UPDATE payment_methods SET last_used_at = NOW() WHERE id = $1")
                .bind(method_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::info!(
            reference = %tx_reference,
            reason = %reason,
            "Transaction settled FAILED"
        );

        Ok(Settlement::Applied(record))
    }

    /// Best-effort forced failure for exceptional paths; never throws.
    async fn force_fail(&self, tx_reference: &str, reason: &str, touched_method: Option<Uuid>) {
        if let Err(e) = self
            .settle_failure(tx_reference, reason, None, touched_method)
            .await
        {
            tracing::error!(
                reference = %tx_reference,
                error = %e,
                "CRITICAL: could not force transaction to FAILED; row may be stuck \
                 PROCESSING until the reconciliation sweep"
            );
        }
    }

    async fn existing_settlement(&self, tx_reference: &str) -> BillingResult<Settlement> {
        let existing: Option<TransactionRecord> = sqlx::query_as(&format!(
            "SELECT {TX_COLUMNS} FROM transactions WHERE reference = $1"
        ))
        .bind(tx_reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some(record) => {
                tracing::info!(
                    reference = %tx_reference,
                    status = %record.status,
                    "Settlement skipped; transaction already terminal"
                );
                Settlement::AlreadyTerminal(record)
            }
            None => Settlement::NotFound,
        })
    }

    /// Owner-scoped point lookup.
    pub async fn get_transaction(
        &self,
        user_id: Uuid,
        lookup: TransactionLookup<'_>,
    ) -> BillingResult<TransactionRecord> {
        let record: Option<TransactionRecord> = match lookup {
            TransactionLookup::Id(id) => {
                sqlx::query_as(&format!(
                    "SELECT {TX_COLUMNS} FROM transactions WHERE id = $1 AND user_id = $2"
                ))
                .bind(id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
            }
            TransactionLookup::Reference(tx_reference) => {
                sqlx::query_as(&format!(
                    "SELECT {TX_COLUMNS} FROM transactions WHERE reference = $1 AND user_id = $2"
                ))
                .bind(tx_reference)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        record.ok_or_else(|| BillingError::TransactionNotFound("transaction not found".to_string()))
    }

    /// Webhook-side lookup: the gateway identifies a payment by the order
    /// receipt (our reference) or by the order id we stored at charge time.
    pub async fn find_for_gateway_ref(
        &self,
        gateway_ref: &str,
    ) -> BillingResult<Option<TransactionRecord>> {
        let record: Option<TransactionRecord> = sqlx::query_as(&format!(
            "SELECT {TX_COLUMNS} FROM transactions
             WHERE reference = $1 OR gateway_order_id = $1"
        ))
        .bind(gateway_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Idempotently stamp the gateway payment id onto an already-terminal
    /// row. Reconciliation may reapply metadata but never statuses.
    pub async fn stamp_gateway_payment_id(
        &self,
        tx_reference: &str,
        gateway_payment_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE transactions
             SET gateway_payment_id = COALESCE(gateway_payment_id, $2)
             WHERE reference = $1",
        )
        .bind(tx_reference)
        .bind(gateway_payment_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(tx_type: TransactionType, amount_cents: i64) -> ProcessPaymentInput {
        ProcessPaymentInput {
            user_id: Uuid::new_v4(),
            amount_cents,
            payment_method_id: Uuid::new_v4(),
            tx_type,
            description: "test".to_string(),
            subscription_id: None,
        }
    }

    #[test]
    fn test_rejects_non_positive_amounts() {
        for amount in [0, -1, -50_000] {
            let err = validate_input(&input(TransactionType::WalletTopup, amount)).unwrap_err();
            assert!(matches!(err, BillingError::InvalidAmount(_)));
        }
    }

    #[test]
    fn test_subscription_payment_requires_subscription_id() {
        let err =
            validate_input(&input(TransactionType::SubscriptionPayment, 29_900)).unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let mut ok = input(TransactionType::SubscriptionPayment, 29_900);
        ok.subscription_id = Some(Uuid::new_v4());
        assert!(validate_input(&ok).is_ok());
    }

    #[test]
    fn test_wallet_topup_needs_no_subscription() {
        assert!(validate_input(&input(TransactionType::WalletTopup, 50_000)).is_ok());
    }
}
