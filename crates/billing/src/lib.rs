// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billforge Billing Module
//!
//! The payment-transaction, subscription and reconciliation core.
//!
//! ## Features
//!
//! - **Transaction Ledger**: every money-movement attempt, PROCESSING to a
//!   single terminal status, never deleted
//! - **Synchronous Payments**: wallet top-ups and subscription payments
//!   charged through the gateway adapter
//! - **Subscription Management**: activation, plan changes, cancellation,
//!   billing-period arithmetic
//! - **Webhook Reconciliation**: idempotent application of gateway truth,
//!   tolerant of duplicate and out-of-order delivery
//! - **Billing History**: append-only record of completed charges, deduped
//!   by external payment id

pub mod error;
pub mod gateway;
pub mod history;
pub mod reference;
pub mod subscriptions;
pub mod transactions;
pub mod wallet;
pub mod webhooks;

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    ChargeOutcome, ChargeRequest, DeclinePolicy, GatewayConfig, GatewayMode, HttpGateway,
    PaymentGateway, SimulatedGateway,
};

// Transactions
pub use transactions::{
    ProcessPaymentInput, Settlement, TransactionLookup, TransactionRecord, TransactionService,
};

// Subscriptions
pub use subscriptions::{Plan, SubscriptionRecord, SubscriptionService};

// Wallet
pub use wallet::WalletService;

// History
pub use history::{BillingHistoryRecord, BillingHistoryService, NewBillingHistory};

// Webhooks
pub use webhooks::{GatewayEventKind, WebhookEnvelope, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub transactions: TransactionService,
    pub subscriptions: SubscriptionService,
    pub wallet: WalletService,
    pub history: BillingHistoryService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = GatewayConfig::from_env()?;
        Ok(Self::new(config, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: GatewayConfig, pool: PgPool) -> Self {
        let gateway = PaymentGateway::from_config(&config);

        Self {
            transactions: TransactionService::new(gateway.clone(), pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            wallet: WalletService::new(pool.clone()),
            history: BillingHistoryService::new(pool.clone()),
            webhooks: WebhookHandler::new(gateway, pool, config.webhook_secret.clone()),
        }
    }
}
