//! Gateway webhook reconciliation
//!
//! The gateway is the system of record for whether money moved; these
//! handlers make local state match what it reports. Deliveries can arrive
//! before, during, long after, or instead of the synchronous path, and can
//! repeat — so every mutation is a compare-and-set against the stored state,
//! and a handler that finds nothing to update is a successful no-op.
//!
//! Failure semantics: once the signature checks out, per-event processing
//! errors are logged and swallowed. The gateway always gets success back;
//! reconciliation, not gateway retries, is the correctness tool.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::subscriptions::SubscriptionService;
use crate::transactions::{Settlement, TransactionService};

type HmacSha256 = Hmac<Sha256>;

/// Events the gateway integration handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEventKind {
    PaymentCaptured,
    PaymentFailed,
    SubscriptionActivated,
    SubscriptionCancelled,
    SubscriptionCompleted,
    SubscriptionCharged,
    SubscriptionUpdated,
    Unrecognized,
}

impl GatewayEventKind {
    pub fn parse(event: &str) -> Self {
        match event {
            "payment.captured" => GatewayEventKind::PaymentCaptured,
            "payment.failed" => GatewayEventKind::PaymentFailed,
            "subscription.activated" => GatewayEventKind::SubscriptionActivated,
            "subscription.cancelled" => GatewayEventKind::SubscriptionCancelled,
            "subscription.completed" => GatewayEventKind::SubscriptionCompleted,
            "subscription.charged" => GatewayEventKind::SubscriptionCharged,
            "subscription.updated" => GatewayEventKind::SubscriptionUpdated,
            _ => GatewayEventKind::Unrecognized,
        }
    }
}

/// Webhook body: `{ "event": ..., "payload": { "<entity>": { "entity": {...} } } }`
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    pub payment: Option<EntityWrapper<PaymentEntity>>,
    pub subscription: Option<EntityWrapper<SubscriptionEntity>>,
}

#[derive(Debug, Deserialize)]
pub struct EntityWrapper<T> {
    pub entity: T,
}

#[derive(Debug, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    pub order_id: Option<String>,
    pub amount: Option<i64>,
    pub method: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionEntity {
    pub id: String,
    pub status: Option<String>,
}

/// Verify `signature_hex == HMAC-SHA256(payload, secret)` in constant time.
/// The body is never parsed before this passes.
pub fn verify_signature(payload: &[u8], signature_hex: &str, secret: &[u8]) -> BillingResult<()> {
    let provided =
        hex::decode(signature_hex.trim()).map_err(|_| BillingError::WebhookSignatureInvalid)?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| BillingError::Config("webhook secret unusable as HMAC key".to_string()))?;
    mac.update(payload);
    let computed = mac.finalize().into_bytes();

    if bool::from(computed.as_slice().ct_eq(provided.as_slice())) {
        Ok(())
    } else {
        Err(BillingError::WebhookSignatureInvalid)
    }
}

fn body_digest(raw_body: &[u8]) -> String {
    hex::encode(Sha256::digest(raw_body))
}

/// Webhook handler for gateway events
pub struct WebhookHandler {
    gateway: PaymentGateway,
    pool: PgPool,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(gateway: PaymentGateway, pool: PgPool, webhook_secret: String) -> Self {
        Self {
            gateway,
            pool,
            webhook_secret,
        }
    }

    /// Signature pre-condition for a delivery; callers reject with 400 on Err.
    pub fn verify(&self, raw_body: &[u8], signature_header: &str) -> BillingResult<()> {
        verify_signature(raw_body, signature_header, self.webhook_secret.as_bytes())
    }

    /// Process a verified delivery. Never fails: every internal error is
    /// logged and recorded on the audit row, and the caller acknowledges the
    /// delivery regardless.
    pub async fn handle_event(&self, raw_body: &[u8]) {
        let envelope: WebhookEnvelope = match serde_json::from_slice(raw_body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Webhook body is not a valid event envelope; ignoring");
                return;
            }
        };

        let digest = body_digest(raw_body);
        let payload_json: serde_json::Value =
            serde_json::from_slice(raw_body).unwrap_or(serde_json::Value::Null);

        // Claim the delivery. Exact replays collide on the digest and stop here;
        // semantically-duplicate events are handled by the per-entity guards below.
        let claimed: Result<Option<(uuid::Uuid,)>, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events (event_type, body_digest, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (body_digest) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&envelope.event)
        .bind(&digest)
        .bind(&payload_json)
        .fetch_optional(&self.pool)
        .await;

        match claimed {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::info!(
                    event = %envelope.event,
                    digest = %digest,
                    "Duplicate webhook delivery; already recorded"
                );
                return;
            }
            Err(e) => {
                // Process anyway; the per-entity guards keep this safe without the audit row
                tracing::error!(error = %e, "Failed to record webhook delivery");
            }
        }

        let result = self.dispatch(&envelope).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            "UPDATE gateway_webhook_events
             SET processing_result = $1, error_message = $2
             WHERE body_digest = $3",
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&digest)
        .execute(&self.pool)
        .await
        {
            tracing::error!(error = %e, "Failed to update webhook audit record");
        }

        if let Err(e) = result {
            tracing::error!(
                event = %envelope.event,
                error = %e,
                "Webhook event processing failed; acknowledging delivery anyway"
            );
        }
    }

    async fn dispatch(&self, envelope: &WebhookEnvelope) -> BillingResult<()> {
        match GatewayEventKind::parse(&envelope.event) {
            GatewayEventKind::PaymentCaptured => self.handle_payment_captured(envelope).await,
            GatewayEventKind::PaymentFailed => self.handle_payment_failed(envelope).await,
            GatewayEventKind::SubscriptionActivated => {
                self.handle_subscription_activated(envelope).await
            }
            GatewayEventKind::SubscriptionCancelled | GatewayEventKind::SubscriptionCompleted => {
                self.handle_subscription_cancelled(envelope).await
            }
            GatewayEventKind::SubscriptionCharged => self.handle_subscription_charged(envelope).await,
            GatewayEventKind::SubscriptionUpdated => self.handle_subscription_updated(envelope).await,
            GatewayEventKind::Unrecognized => {
                tracing::info!(
                    event = %envelope.event,
                    "Received unhandled gateway event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    fn payment<'a>(&self, envelope: &'a WebhookEnvelope) -> BillingResult<&'a PaymentEntity> {
        envelope
            .payload
            .payment
            .as_ref()
            .map(|wrapper| &wrapper.entity)
            .ok_or_else(|| BillingError::InvalidInput("event has no payment entity".to_string()))
    }

    fn subscription<'a>(
        &self,
        envelope: &'a WebhookEnvelope,
    ) -> BillingResult<&'a SubscriptionEntity> {
        envelope
            .payload
            .subscription
            .as_ref()
            .map(|wrapper| &wrapper.entity)
            .ok_or_else(|| {
                BillingError::InvalidInput("event has no subscription entity".to_string())
            })
    }

    fn transactions(&self) -> TransactionService {
        TransactionService::new(self.gateway.clone(), self.pool.clone())
    }

    fn subscriptions(&self) -> SubscriptionService {
        SubscriptionService::new(self.pool.clone())
    }

    async fn handle_payment_captured(&self, envelope: &WebhookEnvelope) -> BillingResult<()> {
        let payment = self.payment(envelope)?;
        let gateway_ref = payment.order_id.as_deref().unwrap_or(&payment.id);

        let transactions = self.transactions();
        let record = match transactions.find_for_gateway_ref(gateway_ref).await? {
            Some(record) => record,
            None => {
                tracing::info!(
                    gateway_ref = %gateway_ref,
                    "payment.captured for unknown transaction; ignoring"
                );
                return Ok(());
            }
        };

        match transactions
            .settle_success(
                &record.reference,
                Some(&payment.id),
                payment.order_id.as_deref(),
                None,
            )
            .await?
        {
            Settlement::Applied(settled) => {
                tracing::info!(
                    reference = %settled.reference,
                    gateway_payment_id = %payment.id,
                    "Payment captured via webhook"
                );
            }
            Settlement::AlreadyTerminal(existing) if existing.is_success() => {
                // Duplicate delivery: reapply metadata only
                transactions
                    .stamp_gateway_payment_id(&existing.reference, &payment.id)
                    .await?;
            }
            Settlement::AlreadyTerminal(existing) => {
                tracing::warn!(
                    reference = %existing.reference,
                    status = %existing.status,
                    "payment.captured for a FAILED transaction; terminal status is never downgraded"
                );
            }
            Settlement::NotFound => {}
        }

        Ok(())
    }

    async fn handle_payment_failed(&self, envelope: &WebhookEnvelope) -> BillingResult<()> {
        let payment = self.payment(envelope)?;
        let gateway_ref = payment.order_id.as_deref().unwrap_or(&payment.id);

        let transactions = self.transactions();
        let record = match transactions.find_for_gateway_ref(gateway_ref).await? {
            Some(record) => record,
            None => {
                tracing::info!(
                    gateway_ref = %gateway_ref,
                    "payment.failed for unknown transaction; ignoring"
                );
                return Ok(());
            }
        };

        let reason = payment
            .error_description
            .as_deref()
            .unwrap_or("Payment failed at gateway");

        match transactions
            .settle_failure(&record.reference, reason, Some(&payment.id), None)
            .await?
        {
            Settlement::Applied(settled) => {
                tracing::info!(
                    reference = %settled.reference,
                    reason = %reason,
                    "Payment failure reconciled via webhook"
                );
            }
            Settlement::AlreadyTerminal(existing) if existing.is_success() => {
                tracing::warn!(
                    reference = %existing.reference,
                    "payment.failed for a SUCCESS transaction; terminal status is never downgraded"
                );
            }
            Settlement::AlreadyTerminal(_) | Settlement::NotFound => {}
        }

        Ok(())
    }

    async fn handle_subscription_activated(&self, envelope: &WebhookEnvelope) -> BillingResult<()> {
        let subscription = self.subscription(envelope)?;

        let updated = self
            .subscriptions()
            .mark_active_from_gateway(&subscription.id, subscription.status.as_deref())
            .await?;

        if updated.is_none() {
            tracing::info!(
                gateway_subscription_id = %subscription.id,
                "subscription.activated for unknown subscription; ignoring"
            );
        }

        Ok(())
    }

    async fn handle_subscription_cancelled(&self, envelope: &WebhookEnvelope) -> BillingResult<()> {
        let subscription = self.subscription(envelope)?;

        let canceled = self
            .subscriptions()
            .cancel_by_gateway_id(&subscription.id)
            .await?;

        if canceled.is_none() {
            tracing::info!(
                gateway_subscription_id = %subscription.id,
                "Cancellation event for unknown or already-canceled subscription; ignoring"
            );
        }

        Ok(())
    }

    async fn handle_subscription_charged(&self, envelope: &WebhookEnvelope) -> BillingResult<()> {
        let subscription = self.subscription(envelope)?;
        // The charge's payment entity carries the external payment id used for dedupe
        let payment = self.payment(envelope)?;

        self.subscriptions()
            .renew_from_charge(
                &subscription.id,
                &payment.id,
                payment.amount,
                payment.method.as_deref().unwrap_or("gateway"),
            )
            .await?;

        Ok(())
    }

    async fn handle_subscription_updated(&self, envelope: &WebhookEnvelope) -> BillingResult<()> {
        let subscription = self.subscription(envelope)?;

        let status = subscription.status.as_deref().unwrap_or("unknown");
        self.subscriptions()
            .merge_gateway_status(&subscription.id, status)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test_secret";

    fn sign(payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"event":"payment.captured"}"#;
        assert!(verify_signature(body, &sign(body), SECRET).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let body = br#"{"event":"payment.captured"}"#;
        let tampered = br#"{"event":"payment.failed"}"#;
        let err = verify_signature(tampered, &sign(body), SECRET).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = br#"{"event":"payment.captured"}"#;
        let sig = sign(body);
        let err = verify_signature(body, &sig, b"other_secret").unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let body = br#"{}"#;
        let err = verify_signature(body, "not hex at all", SECRET).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!(
            GatewayEventKind::parse("payment.captured"),
            GatewayEventKind::PaymentCaptured
        );
        assert_eq!(
            GatewayEventKind::parse("subscription.charged"),
            GatewayEventKind::SubscriptionCharged
        );
        assert_eq!(
            GatewayEventKind::parse("subscription.completed"),
            GatewayEventKind::SubscriptionCompleted
        );
        assert_eq!(
            GatewayEventKind::parse("invoice.paid"),
            GatewayEventKind::Unrecognized
        );
        assert_eq!(GatewayEventKind::parse(""), GatewayEventKind::Unrecognized);
    }

    #[test]
    fn test_envelope_parsing() {
        let body = r#"{
            "event": "subscription.charged",
            "payload": {
                "subscription": { "entity": { "id": "sub_ext_42", "status": "active" } },
                "payment": { "entity": { "id": "pay_ext_99", "amount": 29900, "method": "card" } }
            }
        }"#;
        let envelope: WebhookEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.event, "subscription.charged");
        let subscription = envelope.payload.subscription.unwrap().entity;
        assert_eq!(subscription.id, "sub_ext_42");
        assert_eq!(subscription.status.as_deref(), Some("active"));
        let payment = envelope.payload.payment.unwrap().entity;
        assert_eq!(payment.id, "pay_ext_99");
        assert_eq!(payment.amount, Some(29900));
        assert!(payment.order_id.is_none());
    }

    #[test]
    fn test_envelope_without_payload() {
        let envelope: WebhookEnvelope =
            serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert!(envelope.payload.payment.is_none());
        assert!(envelope.payload.subscription.is_none());
    }

    #[test]
    fn test_body_digest_stable() {
        let body = br#"{"event":"payment.captured"}"#;
        assert_eq!(body_digest(body), body_digest(body));
        assert_ne!(body_digest(body), body_digest(br#"{"event":"x"}"#));
        assert_eq!(body_digest(body).len(), 64);
    }
}
