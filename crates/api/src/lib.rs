// API crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billforge HTTP API
//!
//! Thin axum layer over the billing core: authentication middleware, error
//! mapping, and the route handlers for payments, subscriptions, billing
//! history and the gateway webhook endpoint.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
