//! Payment gateway adapter
//!
//! One interface, two implementations: a simulated gateway with
//! per-instrument decline probabilities (local development and tests, never
//! followed by a webhook) and an HTTP adapter for the real processor. The
//! caller records outcomes; the adapter itself has no side effects.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use billforge_shared::PaymentMethodKind;

use crate::error::{BillingError, BillingResult};

/// How charges are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    Simulated,
    Live,
}

/// Configuration for the payment gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mode: GatewayMode,
    /// API key id for the live gateway
    pub key_id: String,
    /// API key secret for the live gateway
    pub key_secret: String,
    /// Shared secret the gateway signs webhook bodies with
    pub webhook_secret: String,
    /// Base URL of the gateway REST API
    pub base_url: String,
}

impl GatewayConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let mode = match std::env::var("GATEWAY_MODE").as_deref() {
            Ok("live") => GatewayMode::Live,
            _ => GatewayMode::Simulated,
        };

        let webhook_secret = std::env::var("GATEWAY_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("GATEWAY_WEBHOOK_SECRET not set".to_string()))?;

        // Key material is only required in live mode
        let (key_id, key_secret) = if mode == GatewayMode::Live {
            (
                std::env::var("GATEWAY_KEY_ID")
                    .map_err(|_| BillingError::Config("GATEWAY_KEY_ID not set".to_string()))?,
                std::env::var("GATEWAY_KEY_SECRET")
                    .map_err(|_| BillingError::Config("GATEWAY_KEY_SECRET not set".to_string()))?,
            )
        } else {
            (
                std::env::var("GATEWAY_KEY_ID").unwrap_or_default(),
                std::env::var("GATEWAY_KEY_SECRET").unwrap_or_default(),
            )
        };

        Ok(Self {
            mode,
            key_id,
            key_secret,
            webhook_secret,
            base_url: std::env::var("GATEWAY_BASE_URL")
                .unwrap_or_else(|_| "https://api.gateway.test".to_string()),
        })
    }
}

/// A single charge attempt against a payment instrument
#[derive(Debug, Clone)]
pub struct ChargeRequest<'a> {
    pub method_kind: PaymentMethodKind,
    pub amount_cents: i64,
    /// Our transaction reference, passed through as the gateway order receipt
    pub reference: &'a str,
}

/// Result of a charge attempt. Declines are data, not errors.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeOutcome {
    pub success: bool,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub failure_reason: Option<String>,
}

/// Per-instrument decline probabilities for the simulated gateway
///
/// A stand-in policy, not a contract: the live adapter returns genuine
/// gateway results and ignores this entirely.
#[derive(Debug, Clone)]
pub struct DeclinePolicy {
    pub upi: f64,
    pub card: f64,
    pub netbanking: f64,
    pub wallet: f64,
}

impl Default for DeclinePolicy {
    fn default() -> Self {
        Self {
            upi: 0.05,
            card: 0.10,
            netbanking: 0.08,
            wallet: 0.02,
        }
    }
}

impl DeclinePolicy {
    pub fn rate_for(&self, kind: PaymentMethodKind) -> f64 {
        match kind {
            PaymentMethodKind::Upi => self.upi,
            PaymentMethodKind::Card => self.card,
            PaymentMethodKind::Netbanking => self.netbanking,
            PaymentMethodKind::Wallet => self.wallet,
        }
    }
}

/// Simulated gateway: draws against the decline policy
#[derive(Debug, Clone, Default)]
pub struct SimulatedGateway {
    policy: DeclinePolicy,
}

impl SimulatedGateway {
    pub fn new(policy: DeclinePolicy) -> Self {
        Self { policy }
    }

    pub fn attempt_charge(&self, request: &ChargeRequest<'_>) -> ChargeOutcome {
        self.attempt_charge_with_rng(request, &mut rand::thread_rng())
    }

    /// Deterministic variant for tests: the draw comes from the supplied RNG
    pub fn attempt_charge_with_rng<R: Rng>(
        &self,
        request: &ChargeRequest<'_>,
        rng: &mut R,
    ) -> ChargeOutcome {
        let rate = self.policy.rate_for(request.method_kind);
        let declined = rng.gen::<f64>() < rate;

        if declined {
            ChargeOutcome {
                success: false,
                gateway_order_id: None,
                gateway_payment_id: None,
                failure_reason: Some(decline_reason(request.method_kind).to_string()),
            }
        } else {
            let suffix: String = rng
                .sample_iter(&Alphanumeric)
                .take(14)
                .map(char::from)
                .collect();
            ChargeOutcome {
                success: true,
                // Simulated charges have no gateway order; no webhook ever follows
                gateway_order_id: None,
                gateway_payment_id: Some(format!("pay_sim_{suffix}")),
                failure_reason: None,
            }
        }
    }
}

fn decline_reason(kind: PaymentMethodKind) -> &'static str {
    match kind {
        PaymentMethodKind::Upi => "UPI payment failed or was not approved in time",
        PaymentMethodKind::Card => "Card declined by issuing bank",
        PaymentMethodKind::Netbanking => "Net banking payment could not be completed",
        PaymentMethodKind::Wallet => "Wallet provider rejected the debit",
    }
}

#[derive(Debug, Serialize)]
struct GatewayChargeBody<'a> {
    amount: i64,
    currency: &'a str,
    method: &'a str,
    receipt: &'a str,
}

#[derive(Debug, Deserialize)]
struct GatewayChargeResponse {
    id: String,
    #[serde(default)]
    order_id: Option<String>,
    status: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// HTTP adapter for the real payment processor
#[derive(Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    key_id: String,
    key_secret: String,
    base_url: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
            base_url: config.base_url.clone(),
        }
    }

    pub async fn attempt_charge(
        &self,
        request: &ChargeRequest<'_>,
    ) -> BillingResult<ChargeOutcome> {
        let body = GatewayChargeBody {
            amount: request.amount_cents,
            currency: "INR",
            method: request.method_kind.as_str(),
            receipt: request.reference,
        };

        let response = self
            .http
            .post(format!("{}/v1/payments", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::GatewayApi(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BillingError::GatewayApi(format!(
                "gateway returned HTTP {}",
                response.status()
            )));
        }

        let charge: GatewayChargeResponse = response
            .json()
            .await
            .map_err(|e| BillingError::GatewayApi(e.to_string()))?;

        let success = charge.status == "captured";
        Ok(ChargeOutcome {
            success,
            gateway_order_id: charge.order_id,
            gateway_payment_id: Some(charge.id),
            failure_reason: if success {
                None
            } else {
                Some(
                    charge
                        .error_description
                        .unwrap_or_else(|| "Payment was not captured".to_string()),
                )
            },
        })
    }
}

/// The configured gateway the payment path charges against
#[derive(Clone)]
pub enum PaymentGateway {
    Simulated(SimulatedGateway),
    Live(HttpGateway),
}

impl PaymentGateway {
    pub fn from_config(config: &GatewayConfig) -> Self {
        match config.mode {
            GatewayMode::Simulated => {
                PaymentGateway::Simulated(SimulatedGateway::new(DeclinePolicy::default()))
            }
            GatewayMode::Live => PaymentGateway::Live(HttpGateway::new(config)),
        }
    }

    pub async fn attempt_charge(
        &self,
        request: &ChargeRequest<'_>,
    ) -> BillingResult<ChargeOutcome> {
        match self {
            PaymentGateway::Simulated(sim) => Ok(sim.attempt_charge(request)),
            PaymentGateway::Live(live) => live.attempt_charge(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn request(kind: PaymentMethodKind) -> ChargeRequest<'static> {
        ChargeRequest {
            method_kind: kind,
            amount_cents: 29_900,
            reference: "TXN-1700000000-ABC123",
        }
    }

    #[test]
    fn test_zero_decline_rate_always_succeeds() {
        let gateway = SimulatedGateway::new(DeclinePolicy {
            upi: 0.0,
            card: 0.0,
            netbanking: 0.0,
            wallet: 0.0,
        });
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let outcome = gateway.attempt_charge_with_rng(&request(PaymentMethodKind::Card), &mut rng);
            assert!(outcome.success);
            assert!(outcome.gateway_payment_id.is_some());
            assert!(outcome.failure_reason.is_none());
        }
    }

    #[test]
    fn test_full_decline_rate_always_fails() {
        let gateway = SimulatedGateway::new(DeclinePolicy {
            upi: 1.0,
            card: 1.0,
            netbanking: 1.0,
            wallet: 1.0,
        });
        let mut rng = StdRng::seed_from_u64(7);
        for kind in [
            PaymentMethodKind::Upi,
            PaymentMethodKind::Card,
            PaymentMethodKind::Netbanking,
            PaymentMethodKind::Wallet,
        ] {
            let outcome = gateway.attempt_charge_with_rng(&request(kind), &mut rng);
            assert!(!outcome.success);
            assert!(outcome.gateway_payment_id.is_none());
            assert!(outcome.failure_reason.is_some());
        }
    }

    #[test]
    fn test_seeded_draws_are_deterministic() {
        let gateway = SimulatedGateway::default();
        let run = |seed: u64| -> Vec<bool> {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| {
                    gateway
                        .attempt_charge_with_rng(&request(PaymentMethodKind::Upi), &mut rng)
                        .success
                })
                .collect()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_policy_rate_lookup() {
        let policy = DeclinePolicy::default();
        assert!(policy.rate_for(PaymentMethodKind::Card) > policy.rate_for(PaymentMethodKind::Wallet));
    }
}
