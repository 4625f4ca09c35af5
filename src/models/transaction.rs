use serde::{Deserialize, Serialize};

use super::{Gateway, InvoiceStatus, Tier, TransactionStatus};

/// One payment attempt. Amounts are integer minor units (paise, cents).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub solution_id: String,
    /// Tier being purchased
    pub tier: Tier,

    // Provider info
    pub gateway: Gateway,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,

    // Amounts
    pub base_amount: i64,
    pub tax_amount: i64,
    pub total_amount: i64,
    pub currency: String,

    pub status: TransactionStatus,
    pub payment_mode: Option<String>,

    /// Last status seen by reconciliation. Never drives `status`.
    pub provider_status: Option<String>,
    pub provider_checked_at: Option<i64>,

    pub invoice_status: InvoiceStatus,
    pub billing_info: Option<BillingInfo>,
    /// Latest raw gateway payload, kept for audit.
    pub gateway_raw_data: Option<serde_json::Value>,

    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// ISO 3166 alpha-2 country code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<String>,
}

/// Data required to record a new payment attempt.
#[derive(Debug, Clone)]
pub struct CreateTransaction {
    /// Caller-supplied idempotency key; generated when absent.
    pub id: Option<String>,
    pub user_id: String,
    pub user_email: Option<String>,
    pub solution_id: String,
    pub tier: Tier,
    pub gateway: Gateway,
    pub base_amount: i64,
    pub tax_amount: i64,
    pub currency: String,
    pub billing_info: Option<BillingInfo>,
}

/// Gateway details attached to a status transition. `None` fields leave the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct TransitionMetadata {
    pub gateway_payment_id: Option<String>,
    pub payment_mode: Option<String>,
    pub raw: Option<serde_json::Value>,
}

/// Result of a conditional status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { from: TransactionStatus },
    /// The row already holds the target status, or is locked against it.
    AlreadyProcessed { current: TransactionStatus },
    NotFound,
}

/// Filters for listing ledger rows. Dates are unix seconds, `end` exclusive.
#[derive(Debug, Default, Clone)]
pub struct TransactionFilters {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub solution_id: Option<String>,
    pub tier: Option<Tier>,
    pub country: Option<String>,
    pub gateway: Option<Gateway>,
}
