//! billforge-api entry point

use std::sync::Arc;

use billforge_api::config::Config;
use billforge_api::routes;
use billforge_api::state::AppState;
use billforge_billing::BillingService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let migration_pool = billforge_shared::create_migration_pool(&config.database_url).await?;
    billforge_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = billforge_shared::create_pool(&config.database_url).await?;
    let billing = BillingService::from_env(pool.clone())?;

    let state = AppState {
        pool,
        config: Arc::new(config.clone()),
        billing: Arc::new(billing),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "billforge-api listening");

    axum::serve(listener, routes::router(state)).await?;

    Ok(())
}
