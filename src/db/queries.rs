use chrono::Utc;
use rusqlite::{Connection, ErrorCode, params};

use crate::error::{AppError, Result, msg};
use crate::id::EntityType;
use crate::models::*;

use super::from_row::{
    ENTITLEMENT_COLS, SUBSCRIPTION_EVENT_COLS, TRANSACTION_COLS, query_all, query_one,
};

fn now() -> i64 {
    Utc::now().timestamp()
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn to_json_text<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

// ============ Transactions ============

/// Record a new payment attempt in `initiated` state.
///
/// Fails with `Conflict` when the ID already exists, so a caller-supplied ID
/// behaves as an idempotency key.
pub fn create_transaction(conn: &Connection, input: &CreateTransaction) -> Result<Transaction> {
    let id = input
        .id
        .clone()
        .unwrap_or_else(|| EntityType::Transaction.gen_id());
    let now = now();
    let total_amount = input
        .base_amount
        .checked_add(input.tax_amount)
        .ok_or_else(|| AppError::BadRequest(msg::INVALID_AMOUNT.into()))?;
    let billing_json = to_json_text(input.billing_info.as_ref())?;

    let inserted = conn.execute(
        "INSERT INTO transactions (id, user_id, user_email, solution_id, tier, gateway, base_amount, tax_amount, total_amount, currency, status, invoice_status, billing_info, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'initiated', 'none', ?11, ?12, ?12)",
        params![
            &id,
            &input.user_id,
            &input.user_email,
            &input.solution_id,
            input.tier.as_ref(),
            input.gateway.as_ref(),
            input.base_amount,
            input.tax_amount,
            total_amount,
            &input.currency,
            &billing_json,
            now,
        ],
    );

    match inserted {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(AppError::Conflict(msg::TRANSACTION_EXISTS.into()));
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Transaction {
        id,
        user_id: input.user_id.clone(),
        user_email: input.user_email.clone(),
        solution_id: input.solution_id.clone(),
        tier: input.tier,
        gateway: input.gateway,
        gateway_order_id: None,
        gateway_payment_id: None,
        base_amount: input.base_amount,
        tax_amount: input.tax_amount,
        total_amount,
        currency: input.currency.clone(),
        status: TransactionStatus::Initiated,
        payment_mode: None,
        provider_status: None,
        provider_checked_at: None,
        invoice_status: InvoiceStatus::None,
        billing_info: input.billing_info.clone(),
        gateway_raw_data: None,
        created_at: now,
        updated_at: now,
    })
}

pub fn get_transaction(conn: &Connection, id: &str) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!("SELECT {} FROM transactions WHERE id = ?1", TRANSACTION_COLS),
        &[&id],
    )
}

pub fn get_transaction_by_gateway_order(
    conn: &Connection,
    gateway: Gateway,
    gateway_order_id: &str,
) -> Result<Option<Transaction>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM transactions WHERE gateway = ?1 AND gateway_order_id = ?2
             ORDER BY created_at DESC LIMIT 1",
            TRANSACTION_COLS
        ),
        &[&gateway.as_ref(), &gateway_order_id],
    )
}

/// Link the gateway's order handle returned at checkout.
pub fn set_gateway_order_id(conn: &Connection, id: &str, gateway_order_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE transactions SET gateway_order_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![gateway_order_id, now(), id],
    )?;
    Ok(())
}

/// Conditionally move a transaction to `new_status`.
///
/// The WHERE clause is the compare-and-swap: a row that already holds
/// `new_status`, a `completed` row asked to become anything but `refunded`,
/// and a `refunded` row are all left alone and reported as `AlreadyProcessed`.
/// Must stay in step with `TransactionStatus::can_transition_to`.
pub fn transition_transaction_status(
    conn: &Connection,
    id: &str,
    new_status: TransactionStatus,
    metadata: &TransitionMetadata,
) -> Result<TransitionOutcome> {
    let Some(before) = current_status(conn, id)? else {
        return Ok(TransitionOutcome::NotFound);
    };

    let raw_json = to_json_text(metadata.raw.as_ref())?;
    let affected = conn.execute(
        "UPDATE transactions
         SET status = ?2,
             gateway_payment_id = COALESCE(?3, gateway_payment_id),
             payment_mode = COALESCE(?4, payment_mode),
             gateway_raw_data = COALESCE(?5, gateway_raw_data),
             updated_at = ?6
         WHERE id = ?1
           AND status != ?2
           AND status != 'refunded'
           AND (status != 'completed' OR ?2 = 'refunded')",
        params![
            id,
            new_status.as_ref(),
            &metadata.gateway_payment_id,
            &metadata.payment_mode,
            &raw_json,
            now(),
        ],
    )?;

    if affected > 0 {
        return Ok(TransitionOutcome::Applied { from: before });
    }

    match current_status(conn, id)? {
        Some(current) => Ok(TransitionOutcome::AlreadyProcessed { current }),
        None => Ok(TransitionOutcome::NotFound),
    }
}

fn current_status(conn: &Connection, id: &str) -> Result<Option<TransactionStatus>> {
    use rusqlite::OptionalExtension;

    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM transactions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| {
        s.parse()
            .map_err(|_| AppError::Internal(format!("Invalid transaction status '{}'", s)))
    })
    .transpose()
}

/// Cache what reconciliation saw at the provider. Never touches `status`.
pub fn record_provider_status(
    conn: &Connection,
    id: &str,
    provider_status: &str,
    checked_at: i64,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE transactions SET provider_status = ?1, provider_checked_at = ?2 WHERE id = ?3",
        params![provider_status, checked_at, id],
    )?;
    Ok(affected > 0)
}

pub fn set_invoice_status(conn: &Connection, id: &str, status: InvoiceStatus) -> Result<()> {
    conn.execute(
        "UPDATE transactions SET invoice_status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_ref(), now(), id],
    )?;
    Ok(())
}

/// Flip `pending` to `issued`. Returns false if the invoice was not pending.
pub fn mark_invoice_issued(conn: &Connection, id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE transactions SET invoice_status = 'issued', updated_at = ?1
         WHERE id = ?2 AND invoice_status = 'pending'",
        params![now(), id],
    )?;
    Ok(affected > 0)
}

/// List ledger rows matching the filters, oldest first.
pub fn list_transactions(conn: &Connection, filters: &TransactionFilters) -> Result<Vec<Transaction>> {
    let mut where_clause = String::from("WHERE 1=1");
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(start) = filters.start {
        where_clause.push_str(" AND created_at >= ?");
        values.push(Box::new(start));
    }
    if let Some(end) = filters.end {
        where_clause.push_str(" AND created_at < ?");
        values.push(Box::new(end));
    }
    if let Some(ref solution_id) = filters.solution_id {
        where_clause.push_str(" AND solution_id = ?");
        values.push(Box::new(solution_id.clone()));
    }
    if let Some(tier) = filters.tier {
        where_clause.push_str(" AND tier = ?");
        values.push(Box::new(tier.as_ref().to_string()));
    }
    if let Some(gateway) = filters.gateway {
        where_clause.push_str(" AND gateway = ?");
        values.push(Box::new(gateway.as_ref().to_string()));
    }
    if let Some(ref country) = filters.country {
        where_clause.push_str(" AND upper(json_extract(billing_info, '$.country')) = upper(?)");
        values.push(Box::new(country.clone()));
    }

    let sql = format!(
        "SELECT {} FROM transactions {} ORDER BY created_at ASC, id ASC",
        TRANSACTION_COLS, where_clause
    );
    let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
    query_all(conn, &sql, refs.as_slice())
}

// ============ Entitlements ============

pub fn get_entitlement(
    conn: &Connection,
    user_id: &str,
    solution_id: &str,
) -> Result<Option<Entitlement>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM entitlements WHERE user_id = ?1 AND solution_id = ?2",
            ENTITLEMENT_COLS
        ),
        &[&user_id, &solution_id],
    )
}

pub fn get_entitlement_by_token(conn: &Connection, token: &str) -> Result<Option<Entitlement>> {
    query_one(
        conn,
        &format!("SELECT {} FROM entitlements WHERE token = ?1", ENTITLEMENT_COLS),
        &[&token],
    )
}

/// Insert a new entitlement unless one already exists for (user, solution).
/// Returns true if this call created the row.
pub fn insert_entitlement_if_absent(conn: &Connection, input: &CreateEntitlement) -> Result<bool> {
    let now = now();
    let affected = conn.execute(
        "INSERT INTO entitlements (id, user_id, user_email, solution_id, tier, token, quota_daily_limit, daily_usage_count, tier_expires_at, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, 'active', ?9, ?9)
         ON CONFLICT(user_id, solution_id) DO NOTHING",
        params![
            EntityType::Entitlement.gen_id(),
            &input.user_id,
            &input.user_email,
            &input.solution_id,
            input.tier.as_ref(),
            &input.token,
            input.quota_daily_limit,
            input.tier_expires_at,
            now,
        ],
    )?;
    Ok(affected > 0)
}

/// Give a token to a row that has none. Returns false if one was already set.
pub fn assign_token_if_missing(conn: &Connection, id: &str, token: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE entitlements SET token = ?1, updated_at = ?2 WHERE id = ?3 AND token IS NULL",
        params![token, now(), id],
    )?;
    Ok(affected > 0)
}

/// Promote a `free` row to `registered`. Returns false if it wasn't `free`.
pub fn promote_free_to_registered(conn: &Connection, id: &str, quota_limit: i64) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE entitlements SET tier = 'registered', quota_daily_limit = ?1, updated_at = ?2
         WHERE id = ?3 AND tier = 'free'",
        params![quota_limit, now(), id],
    )?;
    Ok(affected > 0)
}

/// Set the row to `pro` until `tier_expires_at`. The token is left as is.
pub fn grant_pro(
    conn: &Connection,
    id: &str,
    tier_expires_at: i64,
    quota_limit: i64,
    user_email: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE entitlements
         SET tier = 'pro', tier_expires_at = ?1, quota_daily_limit = ?2, status = 'active',
             user_email = COALESCE(?3, user_email), updated_at = ?4
         WHERE id = ?5",
        params![tier_expires_at, quota_limit, user_email, now(), id],
    )?;
    Ok(())
}

/// Drop a `pro` row back to `registered` after a refund.
pub fn revoke_pro(conn: &Connection, id: &str, quota_limit: i64) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE entitlements SET tier = 'registered', tier_expires_at = NULL, quota_daily_limit = ?1, updated_at = ?2
         WHERE id = ?3 AND tier = 'pro'",
        params![quota_limit, now(), id],
    )?;
    Ok(affected > 0)
}

/// Downgrade a lapsed `pro` row to `registered`. Status stays `active`.
///
/// Conditional on the row still being lapsed at `now`, so a renewal that lands
/// first wins and this becomes a no-op.
pub fn expire_lapsed_pro(conn: &Connection, id: &str, quota_limit: i64, now: i64) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE entitlements SET tier = 'registered', quota_daily_limit = ?1, updated_at = ?2
         WHERE id = ?3 AND tier = 'pro' AND (tier_expires_at IS NULL OR tier_expires_at <= ?2)",
        params![quota_limit, now, id],
    )?;
    Ok(affected > 0)
}

pub fn list_lapsed_pro(conn: &Connection, now: i64) -> Result<Vec<Entitlement>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM entitlements
             WHERE tier = 'pro' AND (tier_expires_at IS NULL OR tier_expires_at <= ?1)",
            ENTITLEMENT_COLS
        ),
        &[&now],
    )
}

/// Atomic daily quota check-and-increment.
///
/// One statement resets the counter on a new UTC day, tests it against the
/// limit, and increments it. Returns `(used_today, limit)` after the increment,
/// or `None` when the quota is exhausted or the row is inactive.
pub fn consume_quota(
    conn: &Connection,
    id: &str,
    today: &str,
    now: i64,
) -> Result<Option<(i64, i64)>> {
    use rusqlite::OptionalExtension;

    conn.query_row(
        "UPDATE entitlements
         SET daily_usage_count = CASE WHEN last_usage_date = ?2 THEN daily_usage_count + 1 ELSE 1 END,
             last_usage_date = ?2,
             updated_at = ?3
         WHERE id = ?1
           AND status = 'active'
           AND (quota_daily_limit = -1
                OR (CASE WHEN last_usage_date = ?2 THEN daily_usage_count ELSE 0 END) < quota_daily_limit)
         RETURNING daily_usage_count, quota_daily_limit",
        params![id, today, now],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(Into::into)
}

// ============ Subscription History ============

/// Append a history row. Returns false if this (transaction, action) pair was
/// already recorded.
pub fn record_subscription_event(conn: &Connection, event: &CreateSubscriptionEvent) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO subscription_events (id, user_id, solution_id, from_tier, to_tier, action, transaction_id, tier_expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            EntityType::SubscriptionEvent.gen_id(),
            event.user_id,
            event.solution_id,
            event.from_tier.as_ref(),
            event.to_tier.as_ref(),
            event.action.as_ref(),
            event.transaction_id,
            event.tier_expires_at,
            now(),
        ],
    )?;
    Ok(affected > 0)
}

pub fn list_subscription_events(
    conn: &Connection,
    user_id: &str,
    solution_id: &str,
) -> Result<Vec<SubscriptionEvent>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM subscription_events WHERE user_id = ?1 AND solution_id = ?2
             ORDER BY created_at ASC, rowid ASC",
            SUBSCRIPTION_EVENT_COLS
        ),
        &[&user_id, &solution_id],
    )
}
