//! Shared application state

use sqlx::PgPool;
use std::sync::Arc;

use billforge_billing::BillingService;

use crate::config::Config;

/// State shared by every route handler
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
}
