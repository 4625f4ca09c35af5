//! Shared helpers: header parsing, address allow-lists, money, and dates.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use chrono::{DateTime, NaiveDate, Utc};
use subtle::ConstantTimeEq;

use crate::error::{AppError, Result, msg};

/// Extract a Bearer token from the Authorization header.
///
/// Returns the token string without the "Bearer " prefix, or None if
/// the header is missing, malformed, or empty after the prefix.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

/// Constant-time string comparison for secrets and signatures.
///
/// Length is compared first; lengths of hex digests and API keys are not secret.
pub fn secure_eq(expected: &str, provided: &str) -> bool {
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Resolve the address a request came from.
///
/// `X-Forwarded-For` is only honored when the deployment sits behind a proxy
/// that overwrites it; otherwise anyone could claim an allow-listed address.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    peer.map(|addr| addr.ip())
}

/// Match an address against one allow-list entry: a bare IP or a CIDR block.
pub fn ip_matches(ip: IpAddr, entry: &str) -> bool {
    let (net, prefix) = match entry.split_once('/') {
        Some((net, len)) => match len.parse::<u32>() {
            Ok(len) => (net, Some(len)),
            Err(_) => return false,
        },
        None => (entry, None),
    };
    let Ok(net) = net.trim().parse::<IpAddr>() else {
        return false;
    };

    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let len = prefix.unwrap_or(32);
            if len > 32 {
                return false;
            }
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let len = prefix.unwrap_or(128);
            if len > 128 {
                return false;
            }
            let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}

pub fn ip_allowed(ip: IpAddr, allow_list: &[String]) -> bool {
    allow_list.iter().any(|entry| ip_matches(ip, entry))
}

/// Append query parameters to a URL that may already carry a query string.
pub fn append_query_params(url: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let encoded = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, encoded)
}

/// Tax on `base` minor units at `rate_bps` basis points, rounded half-up.
/// `None` when the amount is too large to price.
pub fn compute_tax(base: i64, rate_bps: i64) -> Option<i64> {
    base.checked_mul(rate_bps)?
        .checked_add(5_000)
        .map(|scaled| scaled / 10_000)
}

/// UTC calendar date of a unix timestamp as `YYYY-MM-DD`.
pub fn utc_date(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

/// Inclusive UTC date range as `[start, end)` unix seconds.
pub fn date_range_bounds(start_date: &str, end_date: &str) -> Result<(i64, i64)> {
    let parse = |s: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|_| AppError::BadRequest(format!("Invalid date '{}', expected YYYY-MM-DD", s)))
    };
    let start = parse(start_date)?;
    let end = parse(end_date)?;
    if start > end {
        return Err(AppError::BadRequest(msg::INVALID_DATE_RANGE.into()));
    }
    let day_start = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp());
    let start_ts = day_start(start).ok_or_else(|| AppError::BadRequest("Invalid start date".into()))?;
    let end_ts = end
        .succ_opt()
        .and_then(day_start)
        .ok_or_else(|| AppError::BadRequest("Invalid end date".into()))?;
    Ok((start_ts, end_ts))
}
