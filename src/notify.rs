//! Outbound notification webhooks.
//!
//! Purchase emails and invoice generation live in other services. After a
//! grant commits we POST a JSON event to each configured URL. Failures are
//! logged and never roll anything back; the invoice state on the ledger row
//! records whether the invoice service has acknowledged the event.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use reqwest::Client;
use serde::Serialize;

use crate::db::{DbPool, queries};
use crate::models::{BillingInfo, Tier, Transaction};

const NOTIFY_ATTEMPTS: u32 = 3;
/// Multiplied by the attempt number before the next try.
const NOTIFY_BACKOFF: Duration = Duration::from_millis(100);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("receiver answered {0}")]
    Rejected(reqwest::StatusCode),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseEmailEvent {
    /// Always "purchase_confirmation"
    pub event: String,
    /// Also the receiver's idempotency key
    pub transaction_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub solution_id: String,
    pub tier: Tier,
    pub tier_expires_at: i64,
    pub total_amount: i64,
    pub currency: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceEvent {
    /// Always "invoice_requested"
    pub event: String,
    pub transaction_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub solution_id: String,
    pub gateway: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_payment_id: Option<String>,
    pub base_amount: i64,
    pub tax_amount: i64,
    pub total_amount: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_info: Option<BillingInfo>,
    pub timestamp: i64,
}

impl PurchaseEmailEvent {
    pub fn new(transaction: &Transaction, tier_expires_at: i64) -> Self {
        Self {
            event: "purchase_confirmation".to_string(),
            transaction_id: transaction.id.clone(),
            user_id: transaction.user_id.clone(),
            user_email: transaction.user_email.clone(),
            solution_id: transaction.solution_id.clone(),
            tier: transaction.tier,
            tier_expires_at,
            total_amount: transaction.total_amount,
            currency: transaction.currency.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

impl InvoiceEvent {
    pub fn new(transaction: &Transaction) -> Self {
        Self {
            event: "invoice_requested".to_string(),
            transaction_id: transaction.id.clone(),
            user_id: transaction.user_id.clone(),
            user_email: transaction.user_email.clone(),
            solution_id: transaction.solution_id.clone(),
            gateway: transaction.gateway.to_string(),
            gateway_payment_id: transaction.gateway_payment_id.clone(),
            base_amount: transaction.base_amount,
            tax_amount: transaction.tax_amount,
            total_amount: transaction.total_amount,
            currency: transaction.currency.clone(),
            billing_info: transaction.billing_info.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Spawn `fut`, logging a panic instead of losing it with the task.
fn spawn_logged<F>(label: String, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(AssertUnwindSafe(fut).catch_unwind().map(move |result| {
        if let Err(panic) = result {
            let panic_msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Notification task panicked for '{}': {}", label, panic_msg);
        }
    }));
}

/// Fire-and-forget purchase email. No-op without a URL.
pub fn spawn_purchase_email(client: Client, url: Option<String>, event: PurchaseEmailEvent) {
    let Some(url) = url else {
        return;
    };
    let label = format!("purchase_email:{}", event.transaction_id);
    spawn_logged(label, async move {
        if let Err(e) = deliver(&client, &url, &event).await {
            tracing::error!(
                "Purchase email for transaction {} was not delivered: {}",
                event.transaction_id,
                e
            );
        }
    });
}

/// Fire-and-forget invoice request. On success the ledger row moves from
/// `pending` to `issued`; on failure it stays `pending` and a replayed
/// notification or a manual resolve retries it. No-op without a URL.
pub fn spawn_invoice(client: Client, url: Option<String>, db: DbPool, event: InvoiceEvent) {
    let Some(url) = url else {
        return;
    };
    let label = format!("invoice:{}", event.transaction_id);
    spawn_logged(label, async move {
        if let Err(e) = deliver(&client, &url, &event).await {
            tracing::error!(
                "Invoice for transaction {} left pending: {}",
                event.transaction_id,
                e
            );
            return;
        }
        let marked = db
            .get()
            .map_err(Into::into)
            .and_then(|conn| queries::mark_invoice_issued(&conn, &event.transaction_id));
        if let Err(e) = marked {
            tracing::error!("Failed to mark invoice issued: {}", e);
        }
    });
}

async fn post_event<T: Serialize>(client: &Client, url: &str, event: &T) -> Result<(), DeliveryError> {
    let resp = client
        .post(url)
        .json(event)
        .timeout(NOTIFY_TIMEOUT)
        .send()
        .await?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(DeliveryError::Rejected(resp.status()))
    }
}

/// POST `event` as JSON until a 2xx, up to `NOTIFY_ATTEMPTS` times.
/// Returns the attempt that succeeded, or the last failure.
pub async fn deliver<T: Serialize>(client: &Client, url: &str, event: &T) -> Result<u32, DeliveryError> {
    let mut attempt = 1;
    loop {
        match post_event(client, url, event).await {
            Ok(()) => return Ok(attempt),
            Err(e) if attempt < NOTIFY_ATTEMPTS => {
                tracing::debug!("Notification to {} failed on attempt {}: {}", url, attempt, e);
                tokio::time::sleep(NOTIFY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
