use serde::{Deserialize, Serialize};

use super::{EntitlementStatus, Tier};

/// Access state for one (user, solution) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub id: String,
    pub user_id: String,
    /// Attribute only; never used as a lookup key.
    pub user_email: Option<String>,
    pub solution_id: String,
    pub tier: Tier,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// `-1` means unlimited
    pub quota_daily_limit: i64,
    pub daily_usage_count: i64,
    /// UTC calendar date (`YYYY-MM-DD`) of the last counted use
    pub last_usage_date: Option<String>,
    pub tier_expires_at: Option<i64>,
    pub status: EntitlementStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Entitlement {
    /// A `pro` row whose expiry has passed.
    pub fn pro_lapsed(&self, now: i64) -> bool {
        self.tier == Tier::Pro && self.tier_expires_at.is_none_or(|exp| exp <= now)
    }

    /// Tier as seen by callers: a lapsed `pro` reads as `registered`.
    pub fn effective_tier(&self, now: i64) -> Tier {
        if self.pro_lapsed(now) {
            Tier::Registered
        } else {
            self.tier
        }
    }

    /// Usage counted against `today`, honoring the daily reset.
    pub fn usage_on(&self, today: &str) -> i64 {
        match self.last_usage_date.as_deref() {
            Some(day) if day == today => self.daily_usage_count,
            _ => 0,
        }
    }
}

/// Data for a brand-new entitlement row.
#[derive(Debug, Clone)]
pub struct CreateEntitlement {
    pub user_id: String,
    pub user_email: Option<String>,
    pub solution_id: String,
    pub tier: Tier,
    pub token: String,
    pub quota_daily_limit: i64,
    pub tier_expires_at: Option<i64>,
}

/// Why a validation was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    InvalidToken,
    SolutionMismatch,
    Inactive,
    QuotaExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub allowed: bool,
    pub tier: Tier,
    /// `-1` means unlimited
    pub quota_remaining: i64,
    pub quota_limit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl ValidationResult {
    pub fn denied(reason: DenyReason, tier: Tier, quota_limit: i64) -> Self {
        Self {
            allowed: false,
            tier,
            quota_remaining: 0,
            quota_limit,
            reason: Some(reason),
        }
    }
}
