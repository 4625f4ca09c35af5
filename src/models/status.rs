//! Canonical status vocabulary shared by the ledger, the gateway adapters,
//! and the entitlement store.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Payment gateways the engine accepts notifications from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, AsRefStr,
    Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Gateway {
    Razorpay,
    Payu,
    Phonepe,
}

impl Gateway {
    pub const ALL: [Gateway; 3] = [Gateway::Razorpay, Gateway::Payu, Gateway::Phonepe];
}

/// Ledger status of a single payment attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, AsRefStr,
    Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionStatus {
    Initiated,
    Pending,
    Completed,
    Failed,
    Refunded,
    Unknown,
}

impl TransactionStatus {
    /// Whether the ledger may move from `self` to `next`.
    ///
    /// Same-status writes are no-ops. `completed` only yields to `refunded`,
    /// and `refunded` is final.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        if self == next {
            return false;
        }
        match self {
            TransactionStatus::Refunded => false,
            TransactionStatus::Completed => next == TransactionStatus::Refunded,
            _ => true,
        }
    }

    /// Ledger status a verified gateway status maps to. `unknown` carries no
    /// information and never moves the ledger.
    pub fn from_verified(status: VerifiedStatus) -> Option<TransactionStatus> {
        match status {
            VerifiedStatus::Success => Some(TransactionStatus::Completed),
            VerifiedStatus::Failed => Some(TransactionStatus::Failed),
            VerifiedStatus::Pending => Some(TransactionStatus::Pending),
            VerifiedStatus::Refunded => Some(TransactionStatus::Refunded),
            VerifiedStatus::Unknown => None,
        }
    }
}

/// Gateway-agnostic verdict on a payment, produced by an adapter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerifiedStatus {
    Success,
    Failed,
    Pending,
    Refunded,
    Unknown,
}

impl VerifiedStatus {
    /// Whether a provider's verdict agrees with what the ledger holds.
    /// A ledger row still in `initiated` agrees with a provider `pending`.
    pub fn agrees_with(self, ledger: TransactionStatus) -> bool {
        match TransactionStatus::from_verified(self) {
            Some(mapped) if mapped == ledger => true,
            Some(TransactionStatus::Pending) => ledger == TransactionStatus::Initiated,
            _ => false,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, AsRefStr,
    Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Tier {
    Free,
    Registered,
    Pro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntitlementStatus {
    Active,
    /// Never written by the engine; an operator sets it in the database to
    /// shut an entitlement off, and validation then denies it whatever the tier. A lapsed `pro` is not `expired`: it drops
    /// to `registered` and stays `active`.
    Expired,
}

/// Kind of row in the subscription history.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SubscriptionAction {
    Register,
    Upgrade,
    Renew,
    Expire,
    Refund,
}

/// Progress of the invoice side effect for a completed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InvoiceStatus {
    None,
    Pending,
    Issued,
}
