//! Prefixed ID generation for engine entities.
//!
//! Format: `{prefix}_{uuid_simple}` (32 hex chars, no hyphens). The prefix keeps
//! our IDs visually distinct from gateway order and payment IDs.

use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub enum EntityType {
    Transaction,
    Entitlement,
    SubscriptionEvent,
}

impl EntityType {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Transaction => "txn",
            Self::Entitlement => "ent",
            Self::SubscriptionEvent => "sev",
        }
    }

    pub fn gen_id(&self) -> String {
        format!("{}_{}", self.prefix(), Uuid::new_v4().as_simple())
    }
}

/// Accept caller-supplied transaction IDs (idempotency keys) that are safe to
/// embed in gateway requests and URLs.
pub fn is_valid_external_id(s: &str) -> bool {
    (1..=64).contains(&s.len())
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
