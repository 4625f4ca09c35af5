//! Shared webhook pipeline: authenticate, parse, find the ledger row, verify
//! with the gateway, apply.
//!
//! Providers only retry on non-2xx, so once a notification is authentic we
//! answer 200 unless retrying could help (database trouble).

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
};
use rusqlite::Connection;

use crate::db::{AppState, queries};
use crate::error::AppError;
use crate::models::{Gateway, Transaction};
use crate::payments::{Notification, PaymentNotification, WebhookRequest};
use crate::updater::{self, ApplyOutcome};
use crate::util::client_ip;

/// Result type for webhook operations.
pub type WebhookResult = (StatusCode, &'static str);

/// Largest notification body we read.
const MAX_WEBHOOK_BODY: usize = 256 * 1024;

/// Unwrap a lookup, turning a missing row into a 200 acknowledgement.
fn db_lookup<T>(
    result: Result<Option<T>, AppError>,
    not_found_msg: &'static str,
) -> Result<T, WebhookResult> {
    match result {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err((StatusCode::OK, not_found_msg)),
        Err(e) => {
            tracing::error!("DB error: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Database error"))
        }
    }
}

/// Find the ledger row a notification is about: our transaction ID first,
/// then the gateway's order reference.
fn find_transaction(
    conn: &Connection,
    gateway: Gateway,
    notification: &PaymentNotification,
) -> Result<Option<Transaction>, AppError> {
    if let Some(ref id) = notification.transaction_id {
        if let Some(txn) = queries::get_transaction(conn, id)? {
            return Ok(Some(txn));
        }
    }
    match notification.gateway_order_id {
        Some(ref order_id) => queries::get_transaction_by_gateway_order(conn, gateway, order_id),
        None => Ok(None),
    }
}

fn lookup_transaction(
    state: &AppState,
    gateway: Gateway,
    notification: &PaymentNotification,
) -> Result<Transaction, WebhookResult> {
    let conn = state.db.get().map_err(|e| {
        tracing::error!("DB pool error: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Database error")
    })?;

    let found = find_transaction(&conn, gateway, notification);
    if matches!(found, Ok(None)) {
        tracing::warn!(
            "{} notification for unknown transaction: id={:?}, order={:?}",
            gateway,
            notification.transaction_id,
            notification.gateway_order_id
        );
    }
    let txn = db_lookup(found, "Transaction not found")?;

    if txn.gateway != gateway {
        tracing::warn!(
            "{} notification for transaction {} created on {}; ignoring",
            gateway,
            txn.id,
            txn.gateway
        );
        return Err((StatusCode::OK, "Transaction not found"));
    }

    Ok(txn)
}

/// Run one notification through the pipeline.
pub async fn handle_webhook(state: &AppState, gateway: Gateway, request: Request) -> WebhookResult {
    let Some(adapter) = state.gateways.get(gateway) else {
        tracing::warn!("{} webhook received but the gateway is not configured", gateway);
        return (StatusCode::SERVICE_UNAVAILABLE, "Gateway not configured");
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_WEBHOOK_BODY).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("Failed to read {} webhook body: {}", gateway, e);
            return (StatusCode::BAD_REQUEST, "Unreadable body");
        }
    };

    let webhook = WebhookRequest {
        source_ip: client_ip(&parts.headers, peer, state.config.trust_forwarded_for),
        headers: parts.headers,
        body,
    };

    if let Err(failure) = adapter.authenticate(&webhook) {
        tracing::warn!(
            "Rejected {} webhook from {:?}: {:?}",
            gateway,
            webhook.source_ip,
            failure
        );
        return failure.into_response_parts();
    }

    let notification = match adapter.parse_notification(&webhook) {
        Ok(Notification::Payment(n)) => n,
        Ok(Notification::Ignored(event)) => {
            tracing::debug!("Ignoring {} event '{}'", gateway, event);
            return (StatusCode::OK, "Event ignored");
        }
        Err(e) => {
            tracing::error!("Unparseable {} notification: {}", gateway, e);
            return (StatusCode::OK, "Invalid payload");
        }
    };

    let transaction = match lookup_transaction(state, gateway, &notification) {
        Ok(t) => t,
        Err(result) => return result,
    };

    let verification = tokio::time::timeout(
        state.config.gateway_timeout,
        adapter.to_canonical_event(&notification, &transaction),
    )
    .await;
    let event = match verification {
        Ok(Ok(event)) => event,
        Ok(Err(e)) => {
            tracing::error!(
                "{} verification failed for transaction {}: {}. Needs manual follow-up.",
                gateway,
                transaction.id,
                e
            );
            return (StatusCode::OK, "Verification failed");
        }
        Err(_) => {
            tracing::error!(
                "{} verification timed out for transaction {}. Needs manual follow-up.",
                gateway,
                transaction.id
            );
            return (StatusCode::OK, "Verification failed");
        }
    };

    if event.verified_status != notification.claimed_status {
        tracing::info!(
            "{} notification for {} claimed {} but gateway verified {}",
            gateway,
            transaction.id,
            notification.claimed_status,
            event.verified_status
        );
    }

    match updater::process_event(state, &transaction, &event).await {
        Ok(ApplyOutcome::AlreadyProcessed { .. }) => (StatusCode::OK, "Already processed"),
        Ok(ApplyOutcome::AmountMismatch { .. }) => (StatusCode::OK, "Amount mismatch"),
        Ok(ApplyOutcome::Ignored) => (StatusCode::OK, "Status unknown"),
        Ok(ApplyOutcome::NotFound) => (StatusCode::OK, "Transaction not found"),
        Ok(_) => (StatusCode::OK, "OK"),
        Err(e) => {
            tracing::error!("Failed to apply {} event for {}: {}", gateway, transaction.id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}
