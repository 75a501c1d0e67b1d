//! Integration tests for the payment and reconciliation flows
//!
//! These tests verify that the synchronous path and the webhook path
//! converge on the same state without duplicating side effects.
//!
//! ## Test Coverage
//! - Wallet top-up settles exactly once
//! - payment.captured replay performs no second mutation
//! - subscription.charged replay writes a single billing-history row
//! - API cancellation racing a cancellation webhook converges
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/billforge_test"
//! export GATEWAY_WEBHOOK_SECRET="whsec_test"
//! cargo test --test payment_flow -- --test-threads=1
//! ```

use billforge_billing::{
    BillingService, GatewayConfig, GatewayMode, ProcessPaymentInput,
};
use billforge_shared::TransactionType;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use uuid::Uuid;

const WEBHOOK_SECRET: &str = "whsec_test";

async fn setup() -> (BillingService, PgPool) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    let config = GatewayConfig {
        mode: GatewayMode::Simulated,
        key_id: String::new(),
        key_secret: String::new(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        base_url: "https://api.gateway.test".to_string(),
    };

    (BillingService::new(config, pool.clone()), pool)
}

async fn seed_user(pool: &PgPool) -> (Uuid, Uuid) {
    let user_id: (Uuid,) = sqlx::query_as(
        "INSERT INTO users (email) VALUES ($1) RETURNING id",
    )
    .bind(format!("test-{}@example.test", Uuid::new_v4()))
    .fetch_one(pool)
    .await
    .expect("seed user");

    let method_id: (Uuid,) = sqlx::query_as(
        "INSERT INTO payment_methods (user_id, kind, label) VALUES ($1, 'WALLET', 'Test wallet')
         RETURNING id",
    )
    .bind(user_id.0)
    .fetch_one(pool)
    .await
    .expect("seed payment method");

    (user_id.0, method_id.0)
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).expect("hmac key");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

async fn deliver(billing: &BillingService, body: &str) {
    let signature = sign(body.as_bytes());
    billing
        .webhooks
        .verify(body.as_bytes(), &signature)
        .expect("signature must verify");
    billing.webhooks.handle_event(body.as_bytes()).await;
}

#[tokio::test]
async fn wallet_topup_credits_exactly_once() {
    let (billing, pool) = setup().await;
    let (user_id, method_id) = seed_user(&pool).await;

    let transaction = billing
        .transactions
        .process_payment(ProcessPaymentInput {
            user_id,
            amount_cents: 50_000,
            payment_method_id: method_id,
            tx_type: TransactionType::WalletTopup,
            description: "Top up".to_string(),
            subscription_id: None,
        })
        .await
        .expect("payment path");

    let balance = billing.wallet.balance(user_id).await.expect("balance");
    if transaction.is_success() {
        assert_eq!(balance, 50_000);
    } else {
        assert_eq!(balance, 0);
        assert!(transaction.failure_reason.is_some());
    }
}

#[tokio::test]
async fn captured_webhook_replay_is_idempotent() {
    let (billing, pool) = setup().await;
    let (user_id, _method_id) = seed_user(&pool).await;

    // A transaction the synchronous path never settled (crashed instance):
    // the webhook is the only resolver here
    let reference = format!("TXN-1700000000-{}", &Uuid::new_v4().simple().to_string()[..6]);
    sqlx::query(
        "INSERT INTO transactions
             (user_id, reference, tx_type, amount_cents, status, payment_method, description)
         VALUES ($1, $2, 'WALLET_TOPUP', 25000, 'PROCESSING', 'Test wallet', 'Top up')",
    )
    .bind(user_id)
    .bind(&reference)
    .execute(&pool)
    .await
    .expect("seed processing transaction");

    let body = format!(
        r#"{{"event":"payment.captured","payload":{{"payment":{{"entity":{{"id":"pay_replay_1","order_id":"{reference}"}}}}}}}}"#,
    );

    // Two deliveries differ in whitespace so the digest dedupe does not
    // short-circuit the per-entity guards under test
    deliver(&billing, &body).await;
    deliver(&billing, &format!(" {body}")).await;

    // The credit applies exactly once
    let balance = billing.wallet.balance(user_id).await.expect("balance");
    assert_eq!(balance, 25_000);

    let row: (String, Option<String>) = sqlx::query_as(
        "SELECT status, gateway_payment_id FROM transactions WHERE reference = $1",
    )
    .bind(&reference)
    .fetch_one(&pool)
    .await
    .expect("status");
    assert_eq!(row.0, "SUCCESS");
    assert_eq!(row.1.as_deref(), Some("pay_replay_1"));
}

#[tokio::test]
async fn charged_webhook_replay_writes_one_history_row() {
    let (billing, pool) = setup().await;
    let (user_id, _method_id) = seed_user(&pool).await;

    let plan_id: (Uuid,) = sqlx::query_as(
        "INSERT INTO plans (name, price_cents, interval, interval_count)
         VALUES ('Pro', 29900, 'MONTHLY', 1) RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .expect("seed plan");

    let subscription = billing
        .subscriptions
        .create_for_plan(user_id, plan_id.0, Some("sub_ext_77"))
        .await
        .expect("create subscription");

    sqlx::query("UPDATE subscriptions SET status = 'ACTIVE' WHERE id = $1")
        .bind(subscription.id)
        .execute(&pool)
        .await
        .expect("activate");

    let body = r#"{"event":"subscription.charged","payload":{
        "subscription":{"entity":{"id":"sub_ext_77","status":"active"}},
        "payment":{"entity":{"id":"pay_renewal_9","amount":29900,"method":"card"}}}}"#;

    deliver(&billing, body).await;
    deliver(&billing, &format!(" {body}")).await;

    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM billing_history WHERE gateway_payment_id = 'pay_renewal_9'",
    )
    .fetch_one(&pool)
    .await
    .expect("count");
    assert_eq!(count.0, 1);
}

#[tokio::test]
async fn cancellation_race_converges() {
    let (billing, pool) = setup().await;
    let (user_id, _method_id) = seed_user(&pool).await;

    sqlx::query(
        "INSERT INTO plans (name, price_cents, interval, interval_count)
         VALUES ('Free', 0, 'MONTHLY', 1) ON CONFLICT DO NOTHING",
    )
    .execute(&pool)
    .await
    .expect("seed free plan");

    let plan_id: (Uuid,) = sqlx::query_as(
        "INSERT INTO plans (name, price_cents, interval, interval_count)
         VALUES ('Pro', 29900, 'MONTHLY', 1) RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .expect("seed plan");

    billing
        .subscriptions
        .create_for_plan(user_id, plan_id.0, Some("sub_race_1"))
        .await
        .expect("create subscription");

    // API cancellation first, webhook second: the second writer must no-op
    billing
        .subscriptions
        .cancel_for_user(user_id)
        .await
        .expect("cancel");

    let body = r#"{"event":"subscription.cancelled","payload":{
        "subscription":{"entity":{"id":"sub_race_1","status":"cancelled"}}}}"#;
    deliver(&billing, body).await;

    let status: (String,) =
        sqlx::query_as("SELECT status FROM subscriptions WHERE gateway_subscription_id = 'sub_race_1'")
            .fetch_one(&pool)
            .await
            .expect("status");
    assert_eq!(status.0, "CANCELED");

    let user_status: (String,) =
        sqlx::query_as("SELECT subscription_status FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_one(&pool)
            .await
            .expect("user status");
    assert_eq!(user_status.0, "CANCELED");
}
