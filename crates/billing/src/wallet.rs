//! Wallet balance
//!
//! Balance mutations are single atomic increments against the stored value,
//! never read-modify-write from the application, so concurrent top-ups on
//! different instances cannot lose updates.

use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Credit a wallet inside the caller's transaction.
pub(crate) async fn credit_in_tx(
    tx: &mut PgTransaction<'_, Postgres>,
    user_id: Uuid,
    amount_cents: i64,
) -> BillingResult<()> {
    let updated = sqlx::query(
        r#"
        UPDATE users
        SET wallet_balance_cents = wallet_balance_cents + $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(amount_cents)
    .execute(&mut **tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(BillingError::UserNotFound(user_id.to_string()));
    }

    Ok(())
}

/// Wallet read/write service
pub struct WalletService {
    pool: PgPool,
}

impl WalletService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT wallet_balance_cents FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(balance,)| balance)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))
    }
}
