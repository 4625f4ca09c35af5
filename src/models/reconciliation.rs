use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Gateway, Tier, TransactionStatus, VerifiedStatus};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationFilters {
    pub solution_id: Option<String>,
    pub tier: Option<Tier>,
    pub country: Option<String>,
    pub gateway: Option<Gateway>,
}

/// Count plus per-currency amount totals (minor units). Amounts in different
/// currencies are never summed together.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Bucket {
    pub count: i64,
    pub amounts: BTreeMap<String, i64>,
}

impl Bucket {
    pub fn add(&mut self, currency: &str, amount: i64) {
        self.count += 1;
        *self.amounts.entry(currency.to_string()).or_insert(0) += amount;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    StatusMismatch,
    AmountMismatch,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    pub transaction_id: String,
    pub gateway: Gateway,
    pub kind: DiscrepancyKind,
    pub ledger_status: TransactionStatus,
    pub provider_status: VerifiedStatus,
    /// Raw status string as the provider reported it
    pub provider_raw_status: String,
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_amount: Option<i64>,
    pub currency: String,
}

/// Report over a date range of ledger rows.
///
/// `by_status` covers every row in range. The other breakdowns are revenue
/// views and only count `completed` rows.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub start_date: String,
    pub end_date: String,
    pub total: Bucket,
    pub by_status: BTreeMap<String, Bucket>,
    pub by_solution: BTreeMap<String, Bucket>,
    pub by_tier: BTreeMap<String, Bucket>,
    pub by_country: BTreeMap<String, Bucket>,
    pub by_payment_mode: BTreeMap<String, Bucket>,
    pub by_gateway: BTreeMap<String, Bucket>,
    /// Rows whose provider status was fetched
    pub checked: i64,
    /// Rows whose gateway has no live status query configured
    pub skipped: i64,
    /// Rows whose provider query failed or timed out
    pub errors: i64,
    pub discrepancies: Vec<Discrepancy>,
}
