//! Internal API: payment initiation and status, token issue and validation

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;

#[path = "../common/mod.rs"]
mod common;
use common::*;

fn payu_state() -> AppState {
    test_state(Config {
        payu: Some(payu_config("http://127.0.0.1:1/verify", &["10.0.0.0/8"])),
        default_gateway: Gateway::Payu,
        ..test_config()
    })
}

fn internal_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("Authorization", format!("Bearer {}", INTERNAL_KEY))
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn internal_get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("Authorization", format!("Bearer {}", INTERNAL_KEY))
        .body(Body::empty())
        .unwrap()
}

async fn call(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
    let response = test_app(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

// ============ Health and Auth ============

#[tokio::test]
async fn test_health() {
    let state = payu_state();
    let response = test_app(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_internal_api_requires_key() {
    let state = payu_state();

    let missing = Request::builder()
        .method("POST")
        .uri("/tokens/generate")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"userId":"U1","solutionId":"S1","tier":"registered"}"#))
        .unwrap();
    let response = test_app(state.clone()).oneshot(missing).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .method("GET")
        .uri("/payments/status/T1")
        .header("Authorization", "Bearer not-the-key")
        .body(Body::empty())
        .unwrap();
    let response = test_app(state.clone()).oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // The operator key is not an internal key
    let operator = Request::builder()
        .method("GET")
        .uri("/payments/status/T1")
        .header("Authorization", format!("Bearer {}", OPERATOR_KEY))
        .body(Body::empty())
        .unwrap();
    let response = test_app(state).oneshot(operator).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_key_fails_closed_outside_dev_mode() {
    let state = test_state(Config {
        internal_api_key: None,
        ..test_config()
    });
    let (status, _) = call(&state, internal_get("/payments/status/T1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_key_open_in_dev_mode() {
    let state = test_state(Config {
        internal_api_key: None,
        dev_mode: true,
        ..test_config()
    });
    let request = Request::builder()
        .method("GET")
        .uri("/payments/status/T404")
        .body(Body::empty())
        .unwrap();
    let response = test_app(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============ Payments ============

#[tokio::test]
async fn test_initiate_payment_records_transaction() {
    let state = payu_state();

    let (status, body) = call(
        &state,
        internal_post(
            "/payments/initiate",
            json!({
                "transactionId": "T1",
                "userId": "U1",
                "userEmail": "u1@example.com",
                "solutionId": "S1",
                "amount": BASE_AMOUNT,
                "billingInfo": { "name": "Asha", "country": "IN" }
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "body: {}", body);
    assert_eq!(body["transactionId"], "T1");
    assert_eq!(body["baseAmount"], BASE_AMOUNT);
    assert_eq!(body["taxAmount"], TOTAL_AMOUNT - BASE_AMOUNT);
    assert_eq!(body["totalAmount"], TOTAL_AMOUNT);
    assert_eq!(body["currency"], "inr");

    let handle = &body["providerCheckoutHandle"];
    assert_eq!(handle["gateway"], "payu");
    assert_eq!(handle["handle"], "T1");
    assert_eq!(handle["redirectUrl"], "https://test.payu.in/_payment");
    assert_eq!(handle["params"]["txnid"], "T1");
    assert_eq!(handle["params"]["amount"], "352.82");
    assert_eq!(handle["params"]["firstname"], "Asha");
    assert_eq!(handle["params"]["hash"].as_str().unwrap().len(), 128);

    let conn = state.db.get().unwrap();
    let txn = get_txn(&conn, "T1");
    assert_eq!(txn.status, TransactionStatus::Initiated);
    assert_eq!(txn.gateway, Gateway::Payu);
    assert_eq!(txn.total_amount, TOTAL_AMOUNT);
}

#[tokio::test]
async fn test_initiate_retry_reuses_transaction() {
    let state = payu_state();
    let request = || {
        internal_post(
            "/payments/initiate",
            json!({ "transactionId": "T1", "userId": "U1", "solutionId": "S1", "amount": BASE_AMOUNT }),
        )
    };

    let (first, _) = call(&state, request()).await;
    let (second, body) = call(&state, request()).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body["transactionId"], "T1");

    let conn = state.db.get().unwrap();
    assert_eq!(
        queries::list_transactions(&conn, &TransactionFilters::default())
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_initiate_reused_key_with_other_terms_conflicts() {
    let state = payu_state();
    call(
        &state,
        internal_post(
            "/payments/initiate",
            json!({ "transactionId": "T1", "userId": "U1", "solutionId": "S1", "amount": BASE_AMOUNT }),
        ),
    )
    .await;

    let (status, _) = call(
        &state,
        internal_post(
            "/payments/initiate",
            json!({ "transactionId": "T1", "userId": "U2", "solutionId": "S1", "amount": BASE_AMOUNT }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_initiate_after_completion_conflicts() {
    let state = payu_state();
    {
        let mut conn = state.db.get().unwrap();
        let txn = create_test_transaction(&conn, "T1", "U1", "S1", Gateway::Payu);
        updater::apply_canonical_event(
            &mut conn,
            &state.config,
            &txn,
            &verified_event(&txn, VerifiedStatus::Success, Some(TOTAL_AMOUNT)),
            chrono::Utc::now().timestamp(),
        )
        .unwrap();
    }

    let (status, body) = call(
        &state,
        internal_post(
            "/payments/initiate",
            json!({ "transactionId": "T1", "userId": "U1", "solutionId": "S1", "amount": BASE_AMOUNT }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["details"], "Transaction already processed");
}

#[tokio::test]
async fn test_initiate_validation() {
    let state = payu_state();

    let (status, _) = call(
        &state,
        internal_post(
            "/payments/initiate",
            json!({ "userId": "U1", "solutionId": "S1", "amount": 0 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "zero amount");

    let (status, body) = call(
        &state,
        internal_post(
            "/payments/initiate",
            json!({ "transactionId": "T_HUGE", "userId": "U1", "solutionId": "S1", "amount": 10_000_000_000_000_000_i64 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "amount too large to tax");
    assert_eq!(body["details"], "Amount must be a positive integer in minor units");
    {
        let conn = state.db.get().unwrap();
        assert!(queries::get_transaction(&conn, "T_HUGE").unwrap().is_none());
    }

    let (status, _) = call(
        &state,
        internal_post(
            "/payments/initiate",
            json!({ "transactionId": "has spaces", "userId": "U1", "solutionId": "S1", "amount": 100 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "unsafe transaction id");

    let (status, _) = call(
        &state,
        internal_post(
            "/payments/initiate",
            json!({ "userId": "U1", "solutionId": "S1", "amount": 100, "gateway": "razorpay" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "unconfigured gateway");

    let (status, _) = call(
        &state,
        internal_post("/payments/initiate", json!({ "userId": "U1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "missing fields");
}

#[tokio::test]
async fn test_payment_status_reveals_token_only_when_completed() {
    let state = payu_state();
    let txn = {
        let conn = state.db.get().unwrap();
        create_test_transaction(&conn, "T1", "U1", "S1", Gateway::Payu)
    };

    let (status, body) = call(&state, internal_get("/payments/status/T1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "initiated");
    assert!(body.get("token").is_none());

    {
        let mut conn = state.db.get().unwrap();
        updater::apply_canonical_event(
            &mut conn,
            &state.config,
            &txn,
            &verified_event(&txn, VerifiedStatus::Success, Some(TOTAL_AMOUNT)),
            chrono::Utc::now().timestamp(),
        )
        .unwrap();
    }

    let (_, body) = call(&state, internal_get("/payments/status/T1")).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["userEmail"], "u1@example.com");
    assert!(body["token"].as_str().unwrap().starts_with(tokens::TOKEN_PREFIX));
    assert!(body["tierExpiresAt"].as_i64().is_some());
}

#[tokio::test]
async fn test_payment_status_unknown_transaction() {
    let state = payu_state();
    let (status, _) = call(&state, internal_get("/payments/status/T404")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============ Tokens ============

#[tokio::test]
async fn test_generate_token_returns_redirect() {
    let state = payu_state();

    let (status, body) = call(
        &state,
        internal_post(
            "/tokens/generate",
            json!({ "userId": "U1", "solutionId": "S1", "tier": "registered" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();
    assert!(token.starts_with(tokens::TOKEN_PREFIX));
    assert_eq!(body["tier"], "registered");
    assert_eq!(
        body["redirectUrl"],
        format!("https://apps.example.com/s/S1?token={}", token)
    );

    let (_, again) = call(
        &state,
        internal_post(
            "/tokens/generate",
            json!({ "userId": "U1", "solutionId": "S1", "tier": "registered" }),
        ),
    )
    .await;
    assert_eq!(again["token"], token.as_str());
}

#[tokio::test]
async fn test_generate_pro_token_refused() {
    let state = payu_state();
    let (status, _) = call(
        &state,
        internal_post(
            "/tokens/generate",
            json!({ "userId": "U1", "solutionId": "S1", "tier": "pro" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_validate_token_flow() {
    let state = payu_state();
    let token = {
        let mut conn = state.db.get().unwrap();
        create_test_entitlement(&mut conn, &state.config, "U1", "S1")
    };

    let (status, body) = call(
        &state,
        internal_post(
            "/tokens/validate",
            json!({ "token": token, "solutionId": "S1", "checkOnly": true }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], true);
    assert_eq!(body["tier"], "registered");
    assert_eq!(body["quotaRemaining"], 10);
    assert!(body.get("reason").is_none());

    let (_, body) = call(
        &state,
        internal_post("/tokens/validate", json!({ "token": token, "solutionId": "S1" })),
    )
    .await;
    assert_eq!(body["quotaRemaining"], 9);

    let (status, body) = call(
        &state,
        internal_post("/tokens/validate", json!({ "token": token, "solutionId": "S2" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "denials are answers, not errors");
    assert_eq!(body["allowed"], false);
    assert_eq!(body["reason"], "solution_mismatch");
}

#[tokio::test]
async fn test_validate_quota_exceeded_carries_upgrade_details() {
    let state = payu_state();
    let token = {
        let mut conn = state.db.get().unwrap();
        create_test_entitlement(&mut conn, &state.config, "U1", "S1")
    };

    for _ in 0..10 {
        call(
            &state,
            internal_post("/tokens/validate", json!({ "token": token, "solutionId": "S1" })),
        )
        .await;
    }

    let (status, body) = call(
        &state,
        internal_post("/tokens/validate", json!({ "token": token, "solutionId": "S1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], false);
    assert_eq!(body["reason"], "quota_exceeded");
    assert_eq!(body["tier"], "registered");
    assert_eq!(body["quotaRemaining"], 0);
    assert_eq!(body["quotaLimit"], 10);
}

#[tokio::test]
async fn test_validate_empty_token() {
    let state = payu_state();
    let (status, body) = call(
        &state,
        internal_post("/tokens/validate", json!({ "token": "", "solutionId": "S1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reason"], "invalid_token");
}
