//! Row mapping trait and helpers for reducing boilerplate in queries.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::models::*;

/// Parse a string column into an enum type, converting parse errors to rusqlite errors
/// instead of panicking on unexpected values.
fn parse_enum<T: std::str::FromStr>(row: &Row, col: usize, col_name: &str) -> rusqlite::Result<T> {
    row.get::<_, String>(col)?.parse::<T>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
    })
}

/// Parse an optional JSON text column.
fn parse_json<T: serde::de::DeserializeOwned>(row: &Row, col: usize) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(col)? {
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

/// Trait for constructing a type from a database row.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const TRANSACTION_COLS: &str = "id, user_id, user_email, solution_id, tier, gateway, gateway_order_id, gateway_payment_id, base_amount, tax_amount, total_amount, currency, status, payment_mode, provider_status, provider_checked_at, invoice_status, billing_info, gateway_raw_data, created_at, updated_at";

pub const ENTITLEMENT_COLS: &str = "id, user_id, user_email, solution_id, tier, token, quota_daily_limit, daily_usage_count, last_usage_date, tier_expires_at, status, created_at, updated_at";

pub const SUBSCRIPTION_EVENT_COLS: &str =
    "id, user_id, solution_id, from_tier, to_tier, action, transaction_id, tier_expires_at, created_at";

// ============ FromRow Implementations ============

impl FromRow for Transaction {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Transaction {
            id: row.get(0)?,
            user_id: row.get(1)?,
            user_email: row.get(2)?,
            solution_id: row.get(3)?,
            tier: parse_enum(row, 4, "tier")?,
            gateway: parse_enum(row, 5, "gateway")?,
            gateway_order_id: row.get(6)?,
            gateway_payment_id: row.get(7)?,
            base_amount: row.get(8)?,
            tax_amount: row.get(9)?,
            total_amount: row.get(10)?,
            currency: row.get(11)?,
            status: parse_enum(row, 12, "status")?,
            payment_mode: row.get(13)?,
            provider_status: row.get(14)?,
            provider_checked_at: row.get(15)?,
            invoice_status: parse_enum(row, 16, "invoice_status")?,
            billing_info: parse_json(row, 17)?,
            gateway_raw_data: parse_json(row, 18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
        })
    }
}

impl FromRow for Entitlement {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Entitlement {
            id: row.get(0)?,
            user_id: row.get(1)?,
            user_email: row.get(2)?,
            solution_id: row.get(3)?,
            tier: parse_enum(row, 4, "tier")?,
            token: row.get(5)?,
            quota_daily_limit: row.get(6)?,
            daily_usage_count: row.get(7)?,
            last_usage_date: row.get(8)?,
            tier_expires_at: row.get(9)?,
            status: parse_enum(row, 10, "status")?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }
}

impl FromRow for SubscriptionEvent {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(SubscriptionEvent {
            id: row.get(0)?,
            user_id: row.get(1)?,
            solution_id: row.get(2)?,
            from_tier: parse_enum(row, 3, "from_tier")?,
            to_tier: parse_enum(row, 4, "to_tier")?,
            action: parse_enum(row, 5, "action")?,
            transaction_id: row.get(6)?,
            tier_expires_at: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}
