//! Billing routes: payments, subscriptions, wallet, history

use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use billforge_billing::{
    ProcessPaymentInput, SubscriptionRecord, TransactionLookup, TransactionRecord,
};
use billforge_shared::TransactionType;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Request to process a payment
#[derive(Debug, Deserialize)]
pub struct ProcessPaymentRequest {
    pub amount_cents: i64,
    pub payment_method_id: Uuid,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub subscription_id: Option<Uuid>,
}

/// Response from the payment path; the same shape carries declines
#[derive(Debug, Serialize)]
pub struct ProcessPaymentResponse {
    pub transaction: TransactionRecord,
    pub success: bool,
    pub message: String,
}

/// Process a client-initiated payment.
///
/// A gateway decline is not an error: the terminal FAILED transaction comes
/// back in the same body shape with `success: false` and a 400 status.
pub async fn process_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ProcessPaymentRequest>,
) -> ApiResult<(StatusCode, Json<ProcessPaymentResponse>)> {
    let transaction = state
        .billing
        .transactions
        .process_payment(ProcessPaymentInput {
            user_id: auth_user.user_id,
            amount_cents: req.amount_cents,
            payment_method_id: req.payment_method_id,
            tx_type: req.tx_type,
            description: req.description,
            subscription_id: req.subscription_id,
        })
        .await?;

    if transaction.is_success() {
        Ok((
            StatusCode::OK,
            Json(ProcessPaymentResponse {
                transaction,
                success: true,
                message: "Payment processed successfully".to_string(),
            }),
        ))
    } else {
        let message = transaction
            .failure_reason
            .clone()
            .unwrap_or_else(|| "Payment declined".to_string());
        Ok((
            StatusCode::BAD_REQUEST,
            Json(ProcessPaymentResponse {
                transaction,
                success: false,
                message,
            }),
        ))
    }
}

/// Transaction status lookup query
#[derive(Debug, Deserialize)]
pub struct GetTransactionQuery {
    #[serde(alias = "transactionId")]
    pub transaction_id: Option<Uuid>,
    pub reference: Option<String>,
}

/// Transaction lookup response
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub transaction: TransactionRecord,
}

/// Point lookup of an owned transaction by id or reference
pub async fn get_transaction(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<GetTransactionQuery>,
) -> ApiResult<Json<TransactionResponse>> {
    let lookup = match (&query.transaction_id, &query.reference) {
        (Some(id), _) => TransactionLookup::Id(*id),
        (None, Some(reference)) => TransactionLookup::Reference(reference),
        (None, None) => {
            return Err(ApiError::BadRequest(
                "transaction_id or reference is required".to_string(),
            ))
        }
    };

    let transaction = state
        .billing
        .transactions
        .get_transaction(auth_user.user_id, lookup)
        .await?;

    Ok(Json(TransactionResponse { transaction }))
}

/// Request to create a subscription ahead of its first payment
#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub plan_id: Uuid,
    pub gateway_subscription_id: Option<String>,
}

/// Subscription response
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription: SubscriptionRecord,
}

/// Create a subscription record for a plan; payment activates it
pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .create_for_plan(
            auth_user.user_id,
            req.plan_id,
            req.gateway_subscription_id.as_deref(),
        )
        .await?;

    Ok(Json(SubscriptionResponse { subscription }))
}

/// Request to switch plans without a real-time payment
#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan_id: Uuid,
}

/// Response from a plan change
#[derive(Debug, Serialize)]
pub struct ChangePlanResponse {
    /// The new subscription; absent when the user moved to the free plan
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionRecord>,
    pub message: String,
}

/// Switch to the free plan or a cheaper plan. Paid upgrades are rejected
/// with guidance to the payment flow.
pub async fn change_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ChangePlanRequest>,
) -> ApiResult<Json<ChangePlanResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .change_plan(auth_user.user_id, req.plan_id)
        .await?;

    let message = if subscription.is_some() {
        "Plan changed".to_string()
    } else {
        "Moved to the free plan".to_string()
    };

    Ok(Json(ChangePlanResponse {
        subscription,
        message,
    }))
}

/// Cancel the caller's subscription immediately.
///
/// Safe to race against a concurrently arriving `subscription.cancelled`
/// webhook: both writers drive to the same end state.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .cancel_for_user(auth_user.user_id)
        .await?;

    Ok(Json(SubscriptionResponse { subscription }))
}

/// Billing history response
#[derive(Debug, Serialize)]
pub struct BillingHistoryResponse {
    pub history: Vec<billforge_billing::BillingHistoryRecord>,
}

/// Chronological billing history for the caller
pub async fn billing_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<BillingHistoryResponse>> {
    let history = state
        .billing
        .history
        .get_billing_history(auth_user.user_id)
        .await?;

    Ok(Json(BillingHistoryResponse { history }))
}

/// Wallet balance response
#[derive(Debug, Serialize)]
pub struct WalletBalanceResponse {
    pub balance_cents: i64,
}

/// Current wallet balance for the caller
pub async fn wallet_balance(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<WalletBalanceResponse>> {
    let balance_cents = state.billing.wallet.balance(auth_user.user_id).await?;

    Ok(Json(WalletBalanceResponse { balance_cents }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_payment_request_shape() {
        let body = r#"{
            "amount_cents": 50000,
            "payment_method_id": "7f8a1f3e-34a1-4f9a-9c39-1f12a3b4c5d6",
            "description": "Wallet top-up",
            "type": "WALLET_TOPUP"
        }"#;
        let req: ProcessPaymentRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.amount_cents, 50_000);
        assert_eq!(req.tx_type, TransactionType::WalletTopup);
        assert!(req.subscription_id.is_none());
    }

    #[test]
    fn test_process_payment_request_rejects_unknown_type() {
        let body = r#"{
            "amount_cents": 100,
            "payment_method_id": "7f8a1f3e-34a1-4f9a-9c39-1f12a3b4c5d6",
            "type": "REFUND"
        }"#;
        assert!(serde_json::from_str::<ProcessPaymentRequest>(body).is_err());
    }

    #[test]
    fn test_transaction_query_accepts_both_spellings() {
        let q: GetTransactionQuery =
            serde_json::from_str(r#"{"transactionId":"7f8a1f3e-34a1-4f9a-9c39-1f12a3b4c5d6"}"#)
                .unwrap();
        assert!(q.transaction_id.is_some());

        let q: GetTransactionQuery =
            serde_json::from_str(r#"{"reference":"TXN-1700000000-ABC123"}"#).unwrap();
        assert_eq!(q.reference.as_deref(), Some("TXN-1700000000-ABC123"));
    }
}
