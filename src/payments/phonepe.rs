use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::PhonePeConfig;
use crate::error::{AppError, Result};
use crate::models::{Gateway, Transaction, VerifiedStatus};
use crate::util::secure_eq;

use super::{
    AuthFailure, CanonicalEvent, CheckoutHandle, GatewayAdapter, Notification,
    PaymentNotification, ProviderStatus, WebhookRequest,
};

/// Refresh the OAuth token this many seconds before PhonePe says it expires.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;
const CHECKOUT_EXPIRE_AFTER_SECS: i64 = 1200;

/// PhonePe: JSON webhooks carrying SHA256(username:password) in `Authorization`.
/// The order-status API (OAuth) is the source of truth.
#[derive(Debug, Clone)]
pub struct PhonePeAdapter {
    client: Client,
    config: PhonePeConfig,
    token: Arc<Mutex<Option<CachedToken>>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

/// Callbacks name the event twice: `event` in dotted lowercase and `type` in
/// upper snake case. Either may be missing.
#[derive(Debug, Deserialize)]
struct PhonePeWebhook {
    event: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhonePeEvent {
    OrderCompleted,
    OrderFailed,
    RefundCompleted,
}

impl PhonePeEvent {
    /// Accepts `checkout.order.completed` and `CHECKOUT_ORDER_COMPLETED` alike.
    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('_', ".").as_str() {
            "checkout.order.completed" => Some(Self::OrderCompleted),
            "checkout.order.failed" => Some(Self::OrderFailed),
            "pg.refund.completed" => Some(Self::RefundCompleted),
            _ => None,
        }
    }
}

impl PhonePeWebhook {
    fn name(&self) -> &str {
        self.event
            .as_deref()
            .or(self.kind.as_deref())
            .unwrap_or_default()
    }

    fn classify(&self) -> Option<PhonePeEvent> {
        [self.event.as_deref(), self.kind.as_deref()]
            .into_iter()
            .flatten()
            .find_map(PhonePeEvent::parse)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhonePeOrderPayload {
    merchant_order_id: Option<String>,
    order_id: Option<String>,
    state: Option<String>,
    amount: Option<i64>,
    #[serde(default)]
    payment_details: Vec<PhonePePaymentDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhonePeRefundPayload {
    merchant_refund_id: Option<String>,
    original_merchant_order_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhonePePaymentDetail {
    payment_mode: Option<String>,
    transaction_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhonePeTokenResponse {
    access_token: String,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhonePePayResponse {
    order_id: String,
    redirect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhonePeRefundStatus {
    state: String,
    refund_id: Option<String>,
}

fn map_order_state(state: &str) -> VerifiedStatus {
    match state {
        "COMPLETED" => VerifiedStatus::Success,
        "FAILED" => VerifiedStatus::Failed,
        "PENDING" => VerifiedStatus::Pending,
        _ => VerifiedStatus::Unknown,
    }
}

fn last_detail(details: &[PhonePePaymentDetail]) -> Option<&PhonePePaymentDetail> {
    details.last()
}

impl PhonePeAdapter {
    pub fn new(client: Client, config: PhonePeConfig) -> Self {
        Self {
            client,
            config,
            token: Arc::new(Mutex::new(None)),
        }
    }

    /// Value PhonePe sends in `Authorization`: hex SHA256 of `username:password`.
    pub fn expected_authorization(username: &str, password: &str) -> String {
        hex::encode(Sha256::digest(format!("{}:{}", username, password).as_bytes()))
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        let now = chrono::Utc::now().timestamp();
        if let Some(ref token) = *cached {
            if token.expires_at - TOKEN_REFRESH_MARGIN_SECS > now {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .client
            .post(&self.config.auth_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_version", self.config.client_version.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ProviderUnavailable(format!(
                "PhonePe token request returned {}",
                response.status()
            )));
        }

        let token: PhonePeTokenResponse = response.json().await?;
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at: token.expires_at,
        });
        Ok(access_token)
    }

    async fn get_json(&self, url: String) -> Result<serde_json::Value> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("O-Bearer {}", token))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ProviderUnavailable(format!(
                "PhonePe status API returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn order_status(&self, merchant_order_id: &str) -> Result<ProviderStatus> {
        let raw = self
            .get_json(format!(
                "{}/checkout/v2/order/{}/status",
                self.config.api_base, merchant_order_id
            ))
            .await?;
        let order: PhonePeOrderPayload = serde_json::from_value(raw.clone())?;
        let state = order.state.unwrap_or_default();
        let detail = last_detail(&order.payment_details);

        Ok(ProviderStatus {
            status: map_order_state(&state),
            raw_status: state,
            amount: order.amount,
            gateway_payment_id: detail.and_then(|d| d.transaction_id.clone()),
            payment_mode: detail.and_then(|d| d.payment_mode.clone()),
            raw,
        })
    }

    async fn refund_status(&self, merchant_refund_id: &str) -> Result<ProviderStatus> {
        let raw = self
            .get_json(format!(
                "{}/payments/v2/refund/{}/status",
                self.config.api_base, merchant_refund_id
            ))
            .await?;
        let refund: PhonePeRefundStatus = serde_json::from_value(raw.clone())?;

        // Only a completed refund moves the ledger; anything else leaves it alone
        let status = if refund.state == "COMPLETED" {
            VerifiedStatus::Refunded
        } else {
            VerifiedStatus::Unknown
        };

        Ok(ProviderStatus {
            status,
            raw_status: format!("refund_{}", refund.state.to_ascii_lowercase()),
            amount: None,
            gateway_payment_id: refund.refund_id,
            payment_mode: None,
            raw,
        })
    }
}

#[async_trait]
impl GatewayAdapter for PhonePeAdapter {
    fn gateway(&self) -> Gateway {
        Gateway::Phonepe
    }

    fn authenticate(&self, request: &WebhookRequest) -> std::result::Result<(), AuthFailure> {
        let provided = request
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthFailure::Unauthorized("Missing authorization"))?;
        let provided = provided.strip_prefix("SHA256 ").unwrap_or(provided).trim();

        let expected = Self::expected_authorization(
            &self.config.webhook_username,
            &self.config.webhook_password,
        );
        if secure_eq(&expected, &provided.to_ascii_lowercase()) {
            Ok(())
        } else {
            Err(AuthFailure::Unauthorized("Invalid authorization"))
        }
    }

    fn parse_notification(&self, request: &WebhookRequest) -> Result<Notification> {
        let raw: serde_json::Value = serde_json::from_slice(&request.body)?;
        let webhook: PhonePeWebhook = serde_json::from_value(raw.clone())?;

        let Some(kind) = webhook.classify() else {
            return Ok(Notification::Ignored(webhook.name().to_string()));
        };

        match kind {
            PhonePeEvent::OrderCompleted | PhonePeEvent::OrderFailed => {
                let order: PhonePeOrderPayload = serde_json::from_value(webhook.payload)?;
                let detail = last_detail(&order.payment_details).cloned();
                let claimed_status = order
                    .state
                    .as_deref()
                    .map(map_order_state)
                    .unwrap_or(VerifiedStatus::Unknown);

                Ok(Notification::Payment(PaymentNotification {
                    transaction_id: order.merchant_order_id,
                    gateway_order_id: order.order_id,
                    gateway_payment_id: detail.as_ref().and_then(|d| d.transaction_id.clone()),
                    refund_id: None,
                    claimed_status,
                    amount: order.amount,
                    payment_mode: detail.and_then(|d| d.payment_mode),
                    raw,
                }))
            }
            PhonePeEvent::RefundCompleted => {
                let refund: PhonePeRefundPayload = serde_json::from_value(webhook.payload)?;
                Ok(Notification::Payment(PaymentNotification {
                    transaction_id: refund.original_merchant_order_id,
                    gateway_order_id: None,
                    gateway_payment_id: None,
                    refund_id: refund.merchant_refund_id,
                    claimed_status: VerifiedStatus::Refunded,
                    amount: None,
                    payment_mode: None,
                    raw,
                }))
            }
        }
    }

    async fn create_checkout(
        &self,
        transaction: &Transaction,
        return_url: &str,
    ) -> Result<CheckoutHandle> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(format!("{}/checkout/v2/pay", self.config.api_base))
            .header("Authorization", format!("O-Bearer {}", token))
            .json(&serde_json::json!({
                "merchantOrderId": transaction.id,
                "amount": transaction.total_amount,
                "expireAfter": CHECKOUT_EXPIRE_AFTER_SECS,
                "paymentFlow": {
                    "type": "PG_CHECKOUT",
                    "merchantUrls": { "redirectUrl": return_url },
                },
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::ProviderUnavailable(format!(
                "PhonePe pay request failed ({}): {}",
                status, error_text
            )));
        }

        let pay: PhonePePayResponse = response.json().await?;
        Ok(CheckoutHandle {
            gateway: Gateway::Phonepe,
            handle: pay.order_id,
            redirect_url: pay.redirect_url,
            params: Some(BTreeMap::from([(
                "merchantOrderId".to_string(),
                transaction.id.clone(),
            )])),
        })
    }

    async fn to_canonical_event(
        &self,
        notification: &PaymentNotification,
        transaction: &Transaction,
    ) -> Result<CanonicalEvent> {
        let verified = match (notification.claimed_status, notification.refund_id.as_deref()) {
            (VerifiedStatus::Refunded, Some(refund_id)) => self.refund_status(refund_id).await?,
            (VerifiedStatus::Refunded, None) => {
                return Err(AppError::BadRequest(
                    "PhonePe refund notification without merchantRefundId".into(),
                ));
            }
            _ => self.order_status(&transaction.id).await?,
        };
        Ok(CanonicalEvent::from_provider(verified, transaction))
    }

    async fn query_status(&self, transaction: &Transaction) -> Result<Option<ProviderStatus>> {
        self.order_status(&transaction.id).await.map(Some)
    }
}
