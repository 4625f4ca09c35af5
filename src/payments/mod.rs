//! Gateway adapters.
//!
//! Each gateway authenticates its own notifications, asks its own API for the
//! authoritative payment status where one exists, and hands the rest of the
//! engine a [`CanonicalEvent`]. Nothing outside this module knows a gateway's
//! wire format.

mod payu;
mod phonepe;
mod razorpay;

pub use payu::*;
pub use phonepe::*;
pub use razorpay::*;

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;

use crate::config::Config;
use crate::error::Result;
use crate::models::{Gateway, Transaction, VerifiedStatus};

/// Inbound webhook as the adapters see it.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Resolved source address (peer, or forwarded-for when trusted)
    pub source_ip: Option<IpAddr>,
}

/// Why a notification was rejected before any processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Credentials missing or wrong
    Unauthorized(&'static str),
    /// Source not allowed to call us at all
    Forbidden(&'static str),
}

impl AuthFailure {
    pub fn into_response_parts(self) -> (StatusCode, &'static str) {
        match self {
            AuthFailure::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
            AuthFailure::Forbidden(m) => (StatusCode::FORBIDDEN, m),
        }
    }
}

/// What a gateway's notification claims, before verification.
#[derive(Debug, Clone)]
pub struct PaymentNotification {
    /// Our transaction ID, when the gateway echoes it back
    pub transaction_id: Option<String>,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    /// Gateway refund reference for refund notifications
    pub refund_id: Option<String>,
    pub claimed_status: VerifiedStatus,
    pub amount: Option<i64>,
    pub payment_mode: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum Notification {
    Payment(PaymentNotification),
    /// Event type we don't act on; carries the event name for logging
    Ignored(String),
}

/// Gateway-agnostic payment event, the only input the updater accepts.
#[derive(Debug, Clone)]
pub struct CanonicalEvent {
    pub external_transaction_id: String,
    pub gateway_payment_id: Option<String>,
    pub verified_status: VerifiedStatus,
    /// Amount the gateway says was paid (minor units). `None` skips the amount check.
    pub amount: Option<i64>,
    pub payment_mode: Option<String>,
    pub raw_payload: serde_json::Value,
}

/// Status as reported by a gateway's own status API.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub status: VerifiedStatus,
    /// The gateway's own status word, kept verbatim for reports
    pub raw_status: String,
    pub amount: Option<i64>,
    pub gateway_payment_id: Option<String>,
    pub payment_mode: Option<String>,
    pub raw: serde_json::Value,
}

/// Whatever the client needs to send the buyer to the gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutHandle {
    pub gateway: Gateway,
    /// Gateway order reference (or our transaction ID where the gateway uses it)
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    /// Form fields or SDK options for client-side checkout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, String>>,
}

#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn gateway(&self) -> Gateway;

    /// Check the notification really comes from the gateway. No I/O.
    fn authenticate(&self, request: &WebhookRequest) -> std::result::Result<(), AuthFailure>;

    /// Decode the body into what the gateway claims happened.
    fn parse_notification(&self, request: &WebhookRequest) -> Result<Notification>;

    /// Start a checkout for a freshly recorded transaction.
    async fn create_checkout(&self, transaction: &Transaction, return_url: &str)
    -> Result<CheckoutHandle>;

    /// Turn a claim into a verified event. Gateways with a status API must
    /// ask it; its answer overrides whatever the notification claimed.
    async fn to_canonical_event(
        &self,
        notification: &PaymentNotification,
        transaction: &Transaction,
    ) -> Result<CanonicalEvent>;

    /// Fetch the gateway's current view of a transaction.
    /// `Ok(None)` means this gateway can't be queried with the configured credentials.
    async fn query_status(&self, transaction: &Transaction) -> Result<Option<ProviderStatus>>;
}

impl CanonicalEvent {
    /// Event that trusts the notification itself (signature-authenticated gateways).
    pub fn from_notification(notification: &PaymentNotification, transaction: &Transaction) -> Self {
        Self {
            external_transaction_id: transaction.id.clone(),
            gateway_payment_id: notification.gateway_payment_id.clone(),
            verified_status: notification.claimed_status,
            amount: notification.amount,
            payment_mode: notification.payment_mode.clone(),
            raw_payload: notification.raw.clone(),
        }
    }

    /// Event built from the gateway's status API answer.
    pub fn from_provider(status: ProviderStatus, transaction: &Transaction) -> Self {
        Self {
            external_transaction_id: transaction.id.clone(),
            gateway_payment_id: status.gateway_payment_id,
            verified_status: status.status,
            amount: status.amount,
            payment_mode: status.payment_mode,
            raw_payload: status.raw,
        }
    }
}

/// Configured adapters, keyed by gateway.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    adapters: HashMap<Gateway, Arc<dyn GatewayAdapter>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.adapters.insert(adapter.gateway(), adapter);
        self
    }

    /// Build adapters for every gateway with credentials in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.gateway_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let mut registry = Self::new();
        if let Some(ref rzp) = config.razorpay {
            registry = registry.with(Arc::new(RazorpayAdapter::new(client.clone(), rzp.clone())));
        }
        if let Some(ref payu) = config.payu {
            if payu.allowed_ips.is_empty() {
                tracing::warn!("PAYU_ALLOWED_IPS is empty: every PayU notification will be rejected");
            }
            registry = registry.with(Arc::new(PayuAdapter::new(client.clone(), payu.clone())));
        }
        if let Some(ref phonepe) = config.phonepe {
            registry = registry.with(Arc::new(PhonePeAdapter::new(client.clone(), phonepe.clone())));
        }
        Ok(registry)
    }

    pub fn get(&self, gateway: Gateway) -> Option<Arc<dyn GatewayAdapter>> {
        self.adapters.get(&gateway).cloned()
    }

    pub fn configured(&self) -> Vec<Gateway> {
        let mut gateways: Vec<Gateway> = self.adapters.keys().copied().collect();
        gateways.sort();
        gateways
    }
}

/// Format minor units as a decimal major-unit string ("299.00").
pub fn format_major_units(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Parse a decimal major-unit string ("299", "299.5", "299.00") into minor units.
pub fn parse_major_units(s: &str) -> Option<i64> {
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    whole.checked_mul(100)?.checked_add(frac)
}
