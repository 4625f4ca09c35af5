use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::extractors::{Json, Path};
use crate::id::is_valid_external_id;
use crate::models::{
    BillingInfo, CreateTransaction, Gateway, Tier, Transaction, TransactionStatus,
};
use crate::payments::CheckoutHandle;
use crate::util::compute_tax;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    /// Idempotency key; generated when absent
    pub transaction_id: Option<String>,
    pub user_id: String,
    pub user_email: Option<String>,
    pub solution_id: String,
    /// Pre-tax price in minor units
    pub amount: i64,
    pub currency: Option<String>,
    pub gateway: Option<Gateway>,
    pub billing_info: Option<BillingInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    pub transaction_id: String,
    pub provider_checkout_handle: CheckoutHandle,
    pub base_amount: i64,
    pub tax_amount: i64,
    pub total_amount: i64,
    pub currency: String,
}

/// A retried initiate with the same key and the same terms reuses the row.
fn is_same_attempt(existing: &Transaction, input: &CreateTransaction) -> bool {
    existing.user_id == input.user_id
        && existing.solution_id == input.solution_id
        && existing.gateway == input.gateway
        && existing.base_amount == input.base_amount
        && existing.currency == input.currency
}

pub async fn initiate_payment(
    State(state): State<AppState>,
    Json(req): Json<InitiatePaymentRequest>,
) -> Result<Json<InitiatePaymentResponse>> {
    if req.amount <= 0 {
        return Err(AppError::BadRequest(msg::INVALID_AMOUNT.into()));
    }
    if req.user_id.trim().is_empty() || req.solution_id.trim().is_empty() {
        return Err(AppError::BadRequest("userId and solutionId are required".into()));
    }
    if let Some(ref id) = req.transaction_id {
        if !is_valid_external_id(id) {
            return Err(AppError::BadRequest(
                "transactionId must be 1-64 characters of letters, digits, '-' or '_'".into(),
            ));
        }
    }

    let tax_amount = compute_tax(req.amount, state.config.tax_rate_bps)
        .filter(|tax| req.amount.checked_add(*tax).is_some())
        .ok_or_else(|| AppError::BadRequest(msg::INVALID_AMOUNT.into()))?;

    let gateway = req.gateway.unwrap_or(state.config.default_gateway);
    let adapter = state
        .gateways
        .get(gateway)
        .ok_or_else(|| AppError::BadRequest(msg::GATEWAY_NOT_CONFIGURED.into()))?;

    let input = CreateTransaction {
        id: req.transaction_id.clone(),
        user_id: req.user_id,
        user_email: req.user_email,
        solution_id: req.solution_id,
        tier: Tier::Pro,
        gateway,
        base_amount: req.amount,
        tax_amount,
        currency: req
            .currency
            .map(|c| c.to_lowercase())
            .unwrap_or_else(|| state.config.default_currency.clone()),
        billing_info: req.billing_info,
    };

    let transaction = {
        let conn = state.db.get()?;
        let existing = match input.id {
            Some(ref id) => queries::get_transaction(&conn, id)?,
            None => None,
        };
        match existing {
            Some(t) if t.status != TransactionStatus::Initiated => {
                return Err(AppError::Conflict(msg::TRANSACTION_ALREADY_PROCESSED.into()));
            }
            Some(t) if is_same_attempt(&t, &input) => t,
            Some(_) => return Err(AppError::Conflict(msg::TRANSACTION_EXISTS.into())),
            None => queries::create_transaction(&conn, &input)?,
        }
    };

    let return_url = state
        .config
        .checkout_return_url
        .replace("{transaction_id}", &transaction.id);
    let checkout = adapter.create_checkout(&transaction, &return_url).await?;

    if checkout.handle != transaction.id {
        let conn = state.db.get()?;
        queries::set_gateway_order_id(&conn, &transaction.id, &checkout.handle)?;
    }

    tracing::info!(
        "Payment initiated: transaction={}, user={}, solution={}, gateway={}, total={} {}",
        transaction.id,
        transaction.user_id,
        transaction.solution_id,
        gateway,
        transaction.total_amount,
        transaction.currency
    );

    Ok(Json(InitiatePaymentResponse {
        transaction_id: transaction.id,
        provider_checkout_handle: checkout,
        base_amount: transaction.base_amount,
        tax_amount: transaction.tax_amount,
        total_amount: transaction.total_amount,
        currency: transaction.currency,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusResponse {
    pub transaction_id: String,
    pub status: TransactionStatus,
    /// Present once the payment completed and the entitlement exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_expires_at: Option<i64>,
}

pub async fn payment_status(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<PaymentStatusResponse>> {
    let conn = state.db.get()?;
    let transaction =
        queries::get_transaction(&conn, &transaction_id)?.or_not_found(msg::TRANSACTION_NOT_FOUND)?;

    let entitlement = if transaction.status == TransactionStatus::Completed {
        queries::get_entitlement(&conn, &transaction.user_id, &transaction.solution_id)?
    } else {
        None
    };

    Ok(Json(PaymentStatusResponse {
        transaction_id: transaction.id,
        status: transaction.status,
        token: entitlement.as_ref().and_then(|e| e.token.clone()),
        user_email: transaction
            .user_email
            .or_else(|| entitlement.as_ref().and_then(|e| e.user_email.clone())),
        tier_expires_at: entitlement.and_then(|e| e.tier_expires_at),
    }))
}
