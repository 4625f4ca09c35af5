pub mod common;

use axum::{
    Router,
    extract::{Request, State},
    routing::post,
};

use crate::db::AppState;
use crate::models::Gateway;

use common::{WebhookResult, handle_webhook};

pub async fn handle_razorpay_webhook(State(state): State<AppState>, request: Request) -> WebhookResult {
    handle_webhook(&state, Gateway::Razorpay, request).await
}

pub async fn handle_payu_webhook(State(state): State<AppState>, request: Request) -> WebhookResult {
    handle_webhook(&state, Gateway::Payu, request).await
}

pub async fn handle_phonepe_webhook(State(state): State<AppState>, request: Request) -> WebhookResult {
    handle_webhook(&state, Gateway::Phonepe, request).await
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/razorpay", post(handle_razorpay_webhook))
        .route("/webhooks/payu", post(handle_payu_webhook))
        .route("/webhooks/phonepe", post(handle_phonepe_webhook))
}
