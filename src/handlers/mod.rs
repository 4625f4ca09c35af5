pub mod payments;
pub mod reconciliation;
pub mod tokens;
pub mod webhooks;

use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use serde::Serialize;

use crate::db::AppState;
use crate::middleware::{internal_auth, operator_auth};
use crate::models::Gateway;
use crate::rate_limit;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Every route the service exposes.
pub fn router(state: AppState) -> Router<AppState> {
    let limits = state.config.rate_limit;

    let mut initiate = Router::new().route("/payments/initiate", post(payments::initiate_payment));
    if let Some(layer) = rate_limit::layer(limits.strict_rpm) {
        initiate = initiate.layer(layer);
    }

    let mut generate = Router::new().route("/tokens/generate", post(tokens::generate_token));
    if let Some(layer) = rate_limit::layer(limits.standard_rpm) {
        generate = generate.layer(layer);
    }

    // Internal API (called by the marketplace backend and the solutions)
    let internal = Router::new()
        .merge(initiate)
        .merge(generate)
        .route(
            "/payments/status/{transaction_id}",
            get(payments::payment_status),
        )
        .route("/tokens/validate", post(tokens::validate_token))
        .layer(middleware::from_fn_with_state(state.clone(), internal_auth));

    // Operator API
    let operator = Router::new()
        .route("/reconciliation/report", post(reconciliation::report))
        .route("/reconciliation/resolve", post(reconciliation::resolve))
        .layer(middleware::from_fn_with_state(state.clone(), operator_auth));

    for gateway in Gateway::ALL {
        if state.gateways.get(gateway).is_none() {
            tracing::info!("{} not configured; its webhook will answer 503", gateway);
        }
    }

    Router::new()
        .route("/health", get(health))
        .merge(webhooks::router())
        .merge(internal)
        .merge(operator)
}
