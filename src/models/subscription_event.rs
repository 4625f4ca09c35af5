use serde::{Deserialize, Serialize};

use super::{SubscriptionAction, Tier};

/// Append-only record of a tier change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEvent {
    pub id: String,
    pub user_id: String,
    pub solution_id: String,
    pub from_tier: Tier,
    pub to_tier: Tier,
    pub action: SubscriptionAction,
    pub transaction_id: Option<String>,
    pub tier_expires_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionEvent<'a> {
    pub user_id: &'a str,
    pub solution_id: &'a str,
    pub from_tier: Tier,
    pub to_tier: Tier,
    pub action: SubscriptionAction,
    pub transaction_id: Option<&'a str>,
    pub tier_expires_at: Option<i64>,
}
