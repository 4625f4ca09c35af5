//! Access tokens: issuing them, validating them, and metering their use.
//!
//! A token is an opaque random string bound to one (user, solution)
//! entitlement. It never changes once assigned, so clients that cached it
//! before an upgrade keep working after it.

use rand::RngCore;
use rand::rngs::OsRng;
use rusqlite::{Connection, TransactionBehavior};

use crate::config::Config;
use crate::db::queries;
use crate::error::{AppError, Result, msg};
use crate::models::{
    CreateEntitlement, CreateSubscriptionEvent, DenyReason, Entitlement, EntitlementStatus,
    SubscriptionAction, Tier, ValidationResult,
};
use crate::util::{append_query_params, secure_eq, utc_date};

pub const TOKEN_PREFIX: &str = "tok_";

/// Fresh token: `tok_` followed by 256 random bits in hex.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    format!("{}{}", TOKEN_PREFIX, hex::encode(bytes))
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub tier: Tier,
    /// Whether this call created the entitlement
    pub created: bool,
}

/// Return the token for (user, solution), creating the entitlement if needed.
///
/// Existing entitlements keep their token and tier; a `free` row asked for
/// `registered` is promoted. `pro` is never granted here.
pub fn issue(
    conn: &mut Connection,
    config: &Config,
    user_id: &str,
    user_email: Option<&str>,
    solution_id: &str,
    tier: Tier,
) -> Result<IssuedToken> {
    if tier == Tier::Pro {
        return Err(AppError::BadRequest(msg::PRO_REQUIRES_PAYMENT.into()));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let created = queries::insert_entitlement_if_absent(
        &tx,
        &CreateEntitlement {
            user_id: user_id.to_string(),
            user_email: user_email.map(String::from),
            solution_id: solution_id.to_string(),
            tier,
            token: generate_token(),
            quota_daily_limit: config.quotas.limit_for(tier),
            tier_expires_at: None,
        },
    )?;

    let mut ent = queries::get_entitlement(&tx, user_id, solution_id)?
        .ok_or_else(|| AppError::Internal("Entitlement missing after insert".into()))?;

    if created && tier == Tier::Registered {
        record_tier_change(&tx, &ent, Tier::Free, Tier::Registered, SubscriptionAction::Register)?;
    }

    if !created {
        if ent.token.is_none() {
            queries::assign_token_if_missing(&tx, &ent.id, &generate_token())?;
        }
        if tier == Tier::Registered
            && queries::promote_free_to_registered(
                &tx,
                &ent.id,
                config.quotas.limit_for(Tier::Registered),
            )?
        {
            record_tier_change(&tx, &ent, Tier::Free, Tier::Registered, SubscriptionAction::Register)?;
        }
        ent = queries::get_entitlement(&tx, user_id, solution_id)?
            .ok_or_else(|| AppError::Internal("Entitlement vanished during issue".into()))?;
    }

    tx.commit()?;

    let token = ent
        .token
        .clone()
        .ok_or_else(|| AppError::Internal("Entitlement has no token after issue".into()))?;

    if created {
        tracing::info!(
            "Issued token: user={}, solution={}, tier={}",
            user_id,
            solution_id,
            ent.tier
        );
    }

    Ok(IssuedToken {
        token,
        tier: ent.effective_tier(chrono::Utc::now().timestamp()),
        created,
    })
}

fn record_tier_change(
    conn: &Connection,
    ent: &Entitlement,
    from_tier: Tier,
    to_tier: Tier,
    action: SubscriptionAction,
) -> Result<()> {
    queries::record_subscription_event(
        conn,
        &CreateSubscriptionEvent {
            user_id: &ent.user_id,
            solution_id: &ent.solution_id,
            from_tier,
            to_tier,
            action,
            transaction_id: None,
            tier_expires_at: ent.tier_expires_at,
        },
    )?;
    Ok(())
}

/// Where to send the user with a freshly issued token.
pub fn redirect_url(config: &Config, solution_id: &str, token: &str) -> String {
    let base = config
        .solution_url_template
        .replace("{solution_id}", &urlencoding::encode(solution_id));
    append_query_params(&base, &[("token", token)])
}

/// Persist the downgrade of a lapsed `pro` row. Returns whether this call did it.
///
/// The write is conditional on the row still being lapsed, so a renewal that
/// commits first wins and concurrent callers record the expiry once.
pub fn downgrade_lapsed(
    conn: &mut Connection,
    config: &Config,
    ent: &Entitlement,
    now: i64,
) -> Result<bool> {
    let tx = conn.transaction()?;
    let expired = queries::expire_lapsed_pro(
        &tx,
        &ent.id,
        config.quotas.limit_for(Tier::Registered),
        now,
    )?;
    if expired {
        record_tier_change(&tx, ent, Tier::Pro, Tier::Registered, SubscriptionAction::Expire)?;
    }
    tx.commit()?;

    if expired {
        tracing::info!(
            "Pro expired: user={}, solution={}, expired_at={:?}",
            ent.user_id,
            ent.solution_id,
            ent.tier_expires_at
        );
    }
    Ok(expired)
}

/// Check a token for `solution_id` and, unless `check_only`, count one use.
///
/// With `user_id` the row is found by (user, solution) and the token must
/// still match it; without, it is found by token.
pub fn validate(
    conn: &mut Connection,
    config: &Config,
    token: &str,
    solution_id: &str,
    user_id: Option<&str>,
    check_only: bool,
    now: i64,
) -> Result<ValidationResult> {
    let found = match user_id {
        Some(user_id) => queries::get_entitlement(conn, user_id, solution_id)?
            .filter(|ent| ent.token.as_deref().is_some_and(|t| secure_eq(t, token))),
        None => queries::get_entitlement_by_token(conn, token)?,
    };
    let Some(mut ent) = found else {
        return Ok(ValidationResult::denied(DenyReason::InvalidToken, Tier::Free, 0));
    };

    if ent.solution_id != solution_id {
        return Ok(ValidationResult::denied(
            DenyReason::SolutionMismatch,
            ent.effective_tier(now),
            ent.quota_daily_limit,
        ));
    }

    if ent.pro_lapsed(now) {
        downgrade_lapsed(conn, config, &ent, now)?;
        ent = queries::get_entitlement(conn, &ent.user_id, &ent.solution_id)?
            .ok_or_else(|| AppError::Internal("Entitlement vanished during validation".into()))?;
    }

    let tier = ent.effective_tier(now);

    if ent.status != EntitlementStatus::Active {
        return Ok(ValidationResult::denied(
            DenyReason::Inactive,
            tier,
            ent.quota_daily_limit,
        ));
    }

    let today = utc_date(now);

    if check_only {
        let limit = ent.quota_daily_limit;
        if limit == -1 {
            return Ok(allowed(tier, -1, -1));
        }
        let remaining = (limit - ent.usage_on(&today)).max(0);
        if remaining == 0 {
            return Ok(ValidationResult::denied(DenyReason::QuotaExceeded, tier, limit));
        }
        return Ok(allowed(tier, remaining, limit));
    }

    match queries::consume_quota(conn, &ent.id, &today, now)? {
        Some((_, -1)) => Ok(allowed(tier, -1, -1)),
        Some((used, limit)) => Ok(allowed(tier, (limit - used).max(0), limit)),
        None => {
            tracing::debug!(
                "Quota exhausted: user={}, solution={}, limit={}",
                ent.user_id,
                ent.solution_id,
                ent.quota_daily_limit
            );
            Ok(ValidationResult::denied(
                DenyReason::QuotaExceeded,
                tier,
                ent.quota_daily_limit,
            ))
        }
    }
}

fn allowed(tier: Tier, quota_remaining: i64, quota_limit: i64) -> ValidationResult {
    ValidationResult {
        allowed: true,
        tier,
        quota_remaining,
        quota_limit,
        reason: None,
    }
}

/// Downgrade every lapsed `pro` row. Returns how many this call downgraded.
pub fn sweep_expired(conn: &mut Connection, config: &Config, now: i64) -> Result<usize> {
    let lapsed = queries::list_lapsed_pro(conn, now)?;
    let mut expired = 0;
    for ent in &lapsed {
        if downgrade_lapsed(conn, config, ent, now)? {
            expired += 1;
        }
    }
    Ok(expired)
}
