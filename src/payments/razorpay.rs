use std::collections::BTreeMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;

use crate::config::RazorpayConfig;
use crate::error::{AppError, Result, msg};
use crate::models::{Gateway, Transaction, VerifiedStatus};
use crate::util::secure_eq;

use super::{
    AuthFailure, CanonicalEvent, CheckoutHandle, GatewayAdapter, Notification,
    PaymentNotification, ProviderStatus, WebhookRequest,
};

type HmacSha256 = Hmac<Sha256>;

pub const RAZORPAY_SIGNATURE_HEADER: &str = "x-razorpay-signature";

/// Razorpay: JSON webhooks signed with HMAC-SHA256 of the raw body.
/// The signature is authoritative, so there is no verification callback.
#[derive(Debug, Clone)]
pub struct RazorpayAdapter {
    client: Client,
    config: RazorpayConfig,
}

#[derive(Debug, Deserialize)]
struct RazorpayWebhook {
    event: String,
    #[serde(default)]
    payload: RazorpayPayload,
}

#[derive(Debug, Default, Deserialize)]
struct RazorpayPayload {
    payment: Option<RazorpayEntityWrapper<RazorpayPayment>>,
    refund: Option<RazorpayEntityWrapper<RazorpayRefund>>,
}

#[derive(Debug, Deserialize)]
struct RazorpayEntityWrapper<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct RazorpayPayment {
    id: String,
    order_id: Option<String>,
    amount: Option<i64>,
    status: Option<String>,
    method: Option<String>,
    /// Razorpay sends `[]` instead of `{}` when there are no notes
    #[serde(default)]
    notes: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RazorpayRefund {
    id: String,
    payment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RazorpayPaymentCollection {
    #[serde(default)]
    items: Vec<RazorpayPayment>,
}

impl RazorpayAdapter {
    pub fn new(client: Client, config: RazorpayConfig) -> Self {
        Self { client, config }
    }

    /// Compute the signature Razorpay puts in `X-Razorpay-Signature`.
    pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| AppError::Internal(msg::INVALID_WEBHOOK_SECRET.into()))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify_signature(&self, body: &[u8], signature: &str) -> bool {
        match Self::sign(&self.config.webhook_secret, body) {
            Ok(expected) => secure_eq(&expected, signature.trim()),
            Err(e) => {
                tracing::error!("Razorpay signature check failed: {}", e);
                false
            }
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.config.key_id, &self.config.key_secret) {
            (Some(id), Some(secret)) => Some((id.as_str(), secret.as_str())),
            _ => None,
        }
    }

    fn event_status(event: &str) -> Option<VerifiedStatus> {
        match event {
            "payment.captured" | "order.paid" => Some(VerifiedStatus::Success),
            "payment.failed" => Some(VerifiedStatus::Failed),
            "payment.authorized" => Some(VerifiedStatus::Pending),
            "refund.processed" => Some(VerifiedStatus::Refunded),
            _ => None,
        }
    }

    /// Collapse an order's payment attempts into one verdict.
    fn collapse_payments(items: &[RazorpayPayment]) -> (VerifiedStatus, Option<&RazorpayPayment>) {
        let find = |status: &str| {
            items
                .iter()
                .find(|p| p.status.as_deref() == Some(status))
        };
        if let Some(p) = find("refunded") {
            return (VerifiedStatus::Refunded, Some(p));
        }
        if let Some(p) = find("captured") {
            return (VerifiedStatus::Success, Some(p));
        }
        if let Some(p) = find("authorized") {
            return (VerifiedStatus::Pending, Some(p));
        }
        if let Some(p) = items.last() {
            if p.status.as_deref() == Some("failed") {
                return (VerifiedStatus::Failed, Some(p));
            }
            return (VerifiedStatus::Unknown, Some(p));
        }
        // Order exists but nobody has paid yet
        (VerifiedStatus::Pending, None)
    }
}

fn note_transaction_id(notes: &serde_json::Value) -> Option<String> {
    notes
        .get("transaction_id")
        .and_then(|v| v.as_str())
        .map(String::from)
}

#[async_trait]
impl GatewayAdapter for RazorpayAdapter {
    fn gateway(&self) -> Gateway {
        Gateway::Razorpay
    }

    fn authenticate(&self, request: &WebhookRequest) -> std::result::Result<(), AuthFailure> {
        let signature = request
            .headers
            .get(RAZORPAY_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthFailure::Unauthorized("Missing signature"))?;

        if self.verify_signature(&request.body, signature) {
            Ok(())
        } else {
            Err(AuthFailure::Unauthorized("Invalid signature"))
        }
    }

    fn parse_notification(&self, request: &WebhookRequest) -> Result<Notification> {
        let raw: serde_json::Value = serde_json::from_slice(&request.body)?;
        let webhook: RazorpayWebhook = serde_json::from_value(raw.clone())?;

        let Some(claimed_status) = Self::event_status(&webhook.event) else {
            return Ok(Notification::Ignored(webhook.event));
        };

        let payment = webhook.payload.payment.map(|w| w.entity);
        let refund = webhook.payload.refund.map(|w| w.entity);

        let Some(payment) = payment else {
            return Err(AppError::BadRequest(format!(
                "Razorpay {} event without payment entity",
                webhook.event
            )));
        };

        // Refund amounts can be partial; they are not compared to the order total
        let amount = if claimed_status == VerifiedStatus::Refunded {
            None
        } else {
            payment.amount
        };

        Ok(Notification::Payment(PaymentNotification {
            transaction_id: note_transaction_id(&payment.notes),
            gateway_order_id: payment.order_id.clone(),
            gateway_payment_id: refund
                .as_ref()
                .and_then(|r| r.payment_id.clone())
                .or(Some(payment.id.clone())),
            refund_id: refund.map(|r| r.id),
            claimed_status,
            amount,
            payment_mode: payment.method.clone(),
            raw,
        }))
    }

    async fn create_checkout(
        &self,
        transaction: &Transaction,
        return_url: &str,
    ) -> Result<CheckoutHandle> {
        let (key_id, key_secret) = self.credentials().ok_or_else(|| {
            AppError::BadRequest("Razorpay API credentials are not configured".into())
        })?;

        let response = self
            .client
            .post(format!("{}/v1/orders", self.config.api_base))
            .basic_auth(key_id, Some(key_secret))
            .json(&serde_json::json!({
                "amount": transaction.total_amount,
                "currency": transaction.currency.to_uppercase(),
                "receipt": transaction.id,
                "notes": {
                    "transaction_id": transaction.id,
                    "solution_id": transaction.solution_id,
                },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::ProviderUnavailable(format!(
                "Razorpay order creation failed ({}): {}",
                status, error_text
            )));
        }

        let order: RazorpayOrder = response.json().await?;

        let params = BTreeMap::from([
            ("key".to_string(), key_id.to_string()),
            ("order_id".to_string(), order.id.clone()),
            ("amount".to_string(), transaction.total_amount.to_string()),
            ("currency".to_string(), transaction.currency.to_uppercase()),
            ("callback_url".to_string(), return_url.to_string()),
        ]);

        Ok(CheckoutHandle {
            gateway: Gateway::Razorpay,
            handle: order.id,
            redirect_url: None,
            params: Some(params),
        })
    }

    async fn to_canonical_event(
        &self,
        notification: &PaymentNotification,
        transaction: &Transaction,
    ) -> Result<CanonicalEvent> {
        Ok(CanonicalEvent::from_notification(notification, transaction))
    }

    async fn query_status(&self, transaction: &Transaction) -> Result<Option<ProviderStatus>> {
        let (Some((key_id, key_secret)), Some(order_id)) =
            (self.credentials(), transaction.gateway_order_id.as_deref())
        else {
            return Ok(None);
        };

        let response = self
            .client
            .get(format!("{}/v1/orders/{}/payments", self.config.api_base, order_id))
            .basic_auth(key_id, Some(key_secret))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ProviderUnavailable(format!(
                "Razorpay order lookup returned {}",
                response.status()
            )));
        }

        let raw: serde_json::Value = response.json().await?;
        let collection: RazorpayPaymentCollection = serde_json::from_value(raw.clone())?;
        let (status, payment) = Self::collapse_payments(&collection.items);

        Ok(Some(ProviderStatus {
            status,
            raw_status: payment
                .and_then(|p| p.status.clone())
                .unwrap_or_else(|| "created".to_string()),
            amount: payment.and_then(|p| p.amount),
            gateway_payment_id: payment.map(|p| p.id.clone()),
            payment_mode: payment.and_then(|p| p.method.clone()),
            raw,
        }))
    }
}
