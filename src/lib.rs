//! Payment and entitlement reconciliation engine.
//!
//! Ingests payment notifications from Razorpay, PayU and PhonePe, keeps an
//! idempotent transaction ledger, drives per-user entitlements (tier, quota,
//! expiry, token) from verified events, and reconciles the ledger against
//! each provider on demand.

pub mod config;
pub mod db;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod id;
pub mod middleware;
pub mod models;
pub mod notify;
pub mod payments;
pub mod rate_limit;
pub mod reconcile;
pub mod tokens;
pub mod updater;
pub mod util;
