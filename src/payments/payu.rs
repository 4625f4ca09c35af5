use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha512};

use crate::config::PayuConfig;
use crate::error::{AppError, Result};
use crate::models::{Gateway, Transaction, VerifiedStatus};
use crate::util::ip_allowed;

use super::{
    AuthFailure, CanonicalEvent, CheckoutHandle, GatewayAdapter, Notification,
    PaymentNotification, ProviderStatus, WebhookRequest, format_major_units, parse_major_units,
};

const VERIFY_COMMAND: &str = "verify_payment";

/// PayU: form-encoded notifications from an allow-listed address range.
/// The `verify_payment` postservice is the source of truth.
#[derive(Debug, Clone)]
pub struct PayuAdapter {
    client: Client,
    config: PayuConfig,
}

#[derive(Debug, Deserialize)]
struct PayuNotificationForm {
    txnid: Option<String>,
    mihpayid: Option<String>,
    #[serde(default)]
    status: String,
    unmappedstatus: Option<String>,
    amount: Option<String>,
    mode: Option<String>,
    action: Option<String>,
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayuVerifyResponse {
    #[serde(default)]
    transaction_details: HashMap<String, PayuTransactionDetail>,
}

#[derive(Debug, Deserialize)]
struct PayuTransactionDetail {
    #[serde(default)]
    status: String,
    unmappedstatus: Option<String>,
    mihpayid: Option<String>,
    amt: Option<String>,
    transaction_amount: Option<String>,
    mode: Option<String>,
}

fn sha512_hex(input: &str) -> String {
    hex::encode(Sha512::digest(input.as_bytes()))
}

/// Map PayU's status pair onto the canonical vocabulary.
fn map_status(status: &str, unmapped: Option<&str>) -> VerifiedStatus {
    if unmapped.is_some_and(|u| u.to_ascii_lowercase().contains("refund")) {
        return VerifiedStatus::Refunded;
    }
    match status.to_ascii_lowercase().as_str() {
        "success" => VerifiedStatus::Success,
        "failure" | "failed" => VerifiedStatus::Failed,
        "pending" | "in progress" => VerifiedStatus::Pending,
        _ => VerifiedStatus::Unknown,
    }
}

impl PayuAdapter {
    pub fn new(client: Client, config: PayuConfig) -> Self {
        Self { client, config }
    }

    /// Hash for the `verify_payment` command: sha512(key|command|var1|salt).
    pub fn verify_hash(&self, txnid: &str) -> String {
        sha512_hex(&format!(
            "{}|{}|{}|{}",
            self.config.merchant_key, VERIFY_COMMAND, txnid, self.config.salt
        ))
    }

    /// Request hash for the hosted checkout form:
    /// sha512(key|txnid|amount|productinfo|firstname|email|udf1..udf5||||||salt).
    pub fn payment_hash(
        &self,
        txnid: &str,
        amount: &str,
        productinfo: &str,
        firstname: &str,
        email: &str,
    ) -> String {
        sha512_hex(&format!(
            "{}|{}|{}|{}|{}|{}|||||||||||{}",
            self.config.merchant_key, txnid, amount, productinfo, firstname, email, self.config.salt
        ))
    }

    async fn verify_payment(&self, txnid: &str) -> Result<ProviderStatus> {
        let hash = self.verify_hash(txnid);
        let response = self
            .client
            .post(&self.config.verify_url)
            .form(&[
                ("key", self.config.merchant_key.as_str()),
                ("command", VERIFY_COMMAND),
                ("var1", txnid),
                ("hash", hash.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::ProviderUnavailable(format!(
                "PayU verify_payment returned {}",
                response.status()
            )));
        }

        let raw: serde_json::Value = response.json().await?;
        let parsed: PayuVerifyResponse = serde_json::from_value(raw.clone())?;
        let detail = parsed.transaction_details.get(txnid).ok_or_else(|| {
            AppError::ProviderUnavailable(format!("PayU verify_payment has no record for {}", txnid))
        })?;

        Ok(ProviderStatus {
            status: map_status(&detail.status, detail.unmappedstatus.as_deref()),
            raw_status: detail
                .unmappedstatus
                .clone()
                .unwrap_or_else(|| detail.status.clone()),
            amount: detail
                .amt
                .as_deref()
                .or(detail.transaction_amount.as_deref())
                .and_then(parse_major_units),
            gateway_payment_id: detail.mihpayid.clone(),
            payment_mode: detail.mode.clone(),
            raw,
        })
    }
}

#[async_trait]
impl GatewayAdapter for PayuAdapter {
    fn gateway(&self) -> Gateway {
        Gateway::Payu
    }

    fn authenticate(&self, request: &WebhookRequest) -> std::result::Result<(), AuthFailure> {
        let ip = request
            .source_ip
            .ok_or(AuthFailure::Forbidden("Unknown source address"))?;
        if ip_allowed(ip, &self.config.allowed_ips) {
            Ok(())
        } else {
            tracing::warn!("PayU notification from non-allow-listed address {}", ip);
            Err(AuthFailure::Forbidden("Source address not allowed"))
        }
    }

    fn parse_notification(&self, request: &WebhookRequest) -> Result<Notification> {
        let fields: BTreeMap<String, String> = serde_urlencoded::from_bytes(&request.body)
            .map_err(|e| AppError::BadRequest(format!("Invalid PayU form body: {}", e)))?;
        let raw = serde_json::to_value(&fields)?;
        let form: PayuNotificationForm = serde_json::from_value(raw.clone())?;

        let is_refund = form.action.as_deref() == Some("refund");
        let claimed_status = if is_refund {
            VerifiedStatus::Refunded
        } else {
            map_status(&form.status, form.unmappedstatus.as_deref())
        };

        if form.txnid.is_none() && form.mihpayid.is_none() {
            return Ok(Notification::Ignored("payu notification without txnid".into()));
        }

        Ok(Notification::Payment(PaymentNotification {
            transaction_id: form.txnid.clone(),
            // Checkout uses our transaction ID as PayU's txnid
            gateway_order_id: form.txnid,
            gateway_payment_id: form.mihpayid,
            refund_id: if is_refund { form.request_id } else { None },
            claimed_status,
            amount: if is_refund {
                None
            } else {
                form.amount.as_deref().and_then(parse_major_units)
            },
            payment_mode: form.mode,
            raw,
        }))
    }

    async fn create_checkout(
        &self,
        transaction: &Transaction,
        return_url: &str,
    ) -> Result<CheckoutHandle> {
        let amount = format_major_units(transaction.total_amount);
        let billing = transaction.billing_info.clone().unwrap_or_default();
        let firstname = billing.name.unwrap_or_else(|| "Customer".to_string());
        let email = billing
            .email
            .or_else(|| transaction.user_email.clone())
            .unwrap_or_default();
        let productinfo = transaction.solution_id.clone();
        let hash = self.payment_hash(&transaction.id, &amount, &productinfo, &firstname, &email);

        let params = BTreeMap::from([
            ("key".to_string(), self.config.merchant_key.clone()),
            ("txnid".to_string(), transaction.id.clone()),
            ("amount".to_string(), amount),
            ("productinfo".to_string(), productinfo),
            ("firstname".to_string(), firstname),
            ("email".to_string(), email),
            ("surl".to_string(), return_url.to_string()),
            ("furl".to_string(), return_url.to_string()),
            ("hash".to_string(), hash),
        ]);

        Ok(CheckoutHandle {
            gateway: Gateway::Payu,
            handle: transaction.id.clone(),
            redirect_url: Some(self.config.payment_url.clone()),
            params: Some(params),
        })
    }

    async fn to_canonical_event(
        &self,
        _notification: &PaymentNotification,
        transaction: &Transaction,
    ) -> Result<CanonicalEvent> {
        let verified = self.verify_payment(&transaction.id).await?;
        Ok(CanonicalEvent::from_provider(verified, transaction))
    }

    async fn query_status(&self, transaction: &Transaction) -> Result<Option<ProviderStatus>> {
        self.verify_payment(&transaction.id).await.map(Some)
    }
}
