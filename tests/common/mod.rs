//! Test utilities and fixtures for entitlement engine integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Response;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

// Re-export the main library crate
pub use entitlement_engine::config::{
    Config, PayuConfig, PhonePeConfig, QuotaConfig, RateLimitConfig, RazorpayConfig,
};
pub use entitlement_engine::db::{AppState, DbPool, init_db, queries};
pub use entitlement_engine::handlers;
pub use entitlement_engine::models::*;
pub use entitlement_engine::payments::{
    CanonicalEvent, GatewayRegistry, PhonePeAdapter, RAZORPAY_SIGNATURE_HEADER, RazorpayAdapter,
};
pub use entitlement_engine::reconcile;
pub use entitlement_engine::tokens;
pub use entitlement_engine::updater::{self, ApplyOutcome};

pub const INTERNAL_KEY: &str = "test-internal-key";
pub const OPERATOR_KEY: &str = "test-operator-key";
pub const RAZORPAY_SECRET: &str = "rzp_webhook_secret_for_tests";
pub const PHONEPE_USER: &str = "phonepe-merchant";
pub const PHONEPE_PASSWORD: &str = "phonepe-password";

/// Peer address the test router pretends every request came from
pub const TEST_PEER: &str = "10.20.30.40:443";

/// Pre-tax price used by most fixtures; 18% tax makes the total 35282.
pub const BASE_AMOUNT: i64 = 29_900;
pub const TOTAL_AMOUNT: i64 = 35_282;

pub const ONE_DAY: i64 = 86_400;

/// Create an in-memory test database with schema initialized
pub fn setup_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
    init_db(&conn).expect("Failed to initialize schema");
    conn
}

/// Single-connection in-memory pool; every checkout sees the same database.
pub fn test_pool() -> DbPool {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .connection_timeout(Duration::from_secs(5))
        .build(manager)
        .expect("Failed to create test pool");
    {
        let conn = pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize schema");
    }
    pool
}

/// A unique on-disk database for tests that need real concurrent connections.
pub fn temp_db_path(label: &str) -> String {
    std::env::temp_dir()
        .join(format!("entitlement_engine_{}_{}.db", label, uuid::Uuid::new_v4()))
        .to_string_lossy()
        .into_owned()
}

pub fn open_file_db(path: &str) -> Connection {
    let conn = Connection::open(path).expect("Failed to open test db");
    conn.busy_timeout(Duration::from_secs(5))
        .expect("failed to set busy timeout");
    conn
}

/// Production-like config with keys set, rate limits off, and no gateways.
pub fn test_config() -> Config {
    Config {
        internal_api_key: Some(INTERNAL_KEY.to_string()),
        operator_api_key: Some(OPERATOR_KEY.to_string()),
        rate_limit: RateLimitConfig {
            strict_rpm: 0,
            standard_rpm: 0,
        },
        gateway_timeout: Duration::from_secs(3),
        solution_url_template: "https://apps.example.com/s/{solution_id}".to_string(),
        ..Config::default()
    }
}

pub fn razorpay_config() -> RazorpayConfig {
    RazorpayConfig {
        webhook_secret: RAZORPAY_SECRET.to_string(),
        key_id: None,
        key_secret: None,
        api_base: "http://127.0.0.1:1".to_string(),
    }
}

pub fn payu_config(verify_url: &str, allowed_ips: &[&str]) -> PayuConfig {
    PayuConfig {
        merchant_key: "gtKFFx".to_string(),
        salt: "eCwWELxi".to_string(),
        allowed_ips: allowed_ips.iter().map(|s| s.to_string()).collect(),
        verify_url: verify_url.to_string(),
        payment_url: "https://test.payu.in/_payment".to_string(),
    }
}

pub fn phonepe_config(api_base: &str, auth_url: &str) -> PhonePeConfig {
    PhonePeConfig {
        client_id: "test-client".to_string(),
        client_secret: "test-secret".to_string(),
        client_version: "1".to_string(),
        webhook_username: PHONEPE_USER.to_string(),
        webhook_password: PHONEPE_PASSWORD.to_string(),
        api_base: api_base.to_string(),
        auth_url: auth_url.to_string(),
    }
}

/// State over a fresh pool with adapters for whatever `config` configures.
pub fn test_state(config: Config) -> AppState {
    let gateways = GatewayRegistry::from_config(&config).expect("Failed to build gateways");
    AppState {
        db: test_pool(),
        config: Arc::new(config),
        gateways,
        http_client: reqwest::Client::new(),
    }
}

/// Full router with a fake peer address, as `into_make_service_with_connect_info` would provide.
pub fn test_app(state: AppState) -> Router {
    let peer: SocketAddr = TEST_PEER.parse().expect("valid socket address");
    handlers::router(state.clone())
        .with_state(state)
        .layer(axum::Extension(ConnectInfo(peer)))
}

/// Record an initiated transaction at the standard test price.
pub fn create_test_transaction(
    conn: &Connection,
    id: &str,
    user_id: &str,
    solution_id: &str,
    gateway: Gateway,
) -> Transaction {
    queries::create_transaction(
        conn,
        &CreateTransaction {
            id: Some(id.to_string()),
            user_id: user_id.to_string(),
            user_email: Some(format!("{}@example.com", user_id.to_lowercase())),
            solution_id: solution_id.to_string(),
            tier: Tier::Pro,
            gateway,
            base_amount: BASE_AMOUNT,
            tax_amount: TOTAL_AMOUNT - BASE_AMOUNT,
            currency: "inr".to_string(),
            billing_info: Some(BillingInfo {
                name: Some("Test Buyer".to_string()),
                country: Some("IN".to_string()),
                ..Default::default()
            }),
        },
    )
    .expect("Failed to create test transaction")
}

/// Issue a `registered` token for (user, solution).
pub fn create_test_entitlement(
    conn: &mut Connection,
    config: &Config,
    user_id: &str,
    solution_id: &str,
) -> String {
    tokens::issue(conn, config, user_id, None, solution_id, Tier::Registered)
        .expect("Failed to issue test token")
        .token
}

/// A verified event for `txn` as a gateway would report it.
pub fn verified_event(txn: &Transaction, status: VerifiedStatus, amount: Option<i64>) -> CanonicalEvent {
    CanonicalEvent {
        external_transaction_id: txn.id.clone(),
        gateway_payment_id: Some(format!("pay_{}", txn.id)),
        verified_status: status,
        amount,
        payment_mode: Some("upi".to_string()),
        raw_payload: serde_json::json!({ "test": true }),
    }
}

pub fn get_txn(conn: &Connection, id: &str) -> Transaction {
    queries::get_transaction(conn, id)
        .expect("Query failed")
        .expect("Transaction should exist")
}

pub fn get_ent(conn: &Connection, user_id: &str, solution_id: &str) -> Entitlement {
    queries::get_entitlement(conn, user_id, solution_id)
        .expect("Query failed")
        .expect("Entitlement should exist")
}

/// Razorpay webhook body for a payment event on `transaction_id`.
pub fn razorpay_payment_body(event: &str, transaction_id: &str, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "entity": "event",
        "event": event,
        "payload": {
            "payment": {
                "entity": {
                    "id": format!("pay_{}", transaction_id),
                    "order_id": format!("order_{}", transaction_id),
                    "amount": amount,
                    "currency": "INR",
                    "status": "captured",
                    "method": "upi",
                    "notes": { "transaction_id": transaction_id }
                }
            }
        }
    }))
    .expect("serializable body")
}

pub fn razorpay_signature(body: &[u8]) -> String {
    RazorpayAdapter::sign(RAZORPAY_SECRET, body).expect("signing should work")
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    if bytes.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(&bytes).expect("Response should be JSON")
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    String::from_utf8_lossy(&bytes).into_owned()
}

/// PayU `verify_payment` answer for one transaction.
pub fn payu_verify_body(txnid: &str, status: &str, amount: &str) -> serde_json::Value {
    let unmapped = if status == "success" { "captured" } else { "failed" };
    serde_json::json!({
        "status": 1,
        "msg": "1 out of 1 Transactions Fetched Successfully",
        "transaction_details": {
            txnid: {
                "mihpayid": "403993715521937565",
                "txnid": txnid,
                "status": status,
                "unmappedstatus": unmapped,
                "amt": amount,
                "mode": "UPI"
            }
        }
    })
}
