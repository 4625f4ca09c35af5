//! Applies verified payment events to the ledger and the entitlement store.
//!
//! Every canonical event goes through [`apply_canonical_event`], which does the
//! ledger compare-and-swap and the entitlement change inside one IMMEDIATE
//! SQLite transaction. A replayed or out-of-order event loses the CAS and
//! changes nothing, so provider retries converge.

use rusqlite::{Connection, TransactionBehavior};

use crate::config::Config;
use crate::db::{AppState, queries};
use crate::error::Result;
use crate::models::{
    CreateEntitlement, CreateSubscriptionEvent, InvoiceStatus, SubscriptionAction, Tier,
    Transaction, TransactionStatus, TransitionMetadata, TransitionOutcome, VerifiedStatus,
};
use crate::notify::{InvoiceEvent, PurchaseEmailEvent, spawn_invoice, spawn_purchase_email};
use crate::payments::CanonicalEvent;
use crate::tokens::generate_token;

/// What applying one canonical event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Payment completed and the entitlement is now `pro`
    Granted {
        action: SubscriptionAction,
        from_tier: Tier,
        tier_expires_at: i64,
    },
    /// Completed payment refunded; `downgraded` is false when the entitlement
    /// was no longer `pro`
    Refunded { downgraded: bool },
    /// Non-terminal status recorded (`pending`, `failed`, or a refund of an
    /// unpaid attempt)
    Transitioned {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    AlreadyProcessed { current: TransactionStatus },
    /// Gateway amount disagrees with the ledger total; nothing written
    AmountMismatch { expected: i64, received: i64 },
    /// Gateway could not say what happened; nothing written
    Ignored,
    NotFound,
}

impl ApplyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Granted { .. } => "granted",
            ApplyOutcome::Refunded { .. } => "refunded",
            ApplyOutcome::Transitioned { .. } => "transitioned",
            ApplyOutcome::AlreadyProcessed { .. } => "already_processed",
            ApplyOutcome::AmountMismatch { .. } => "amount_mismatch",
            ApplyOutcome::Ignored => "ignored",
            ApplyOutcome::NotFound => "not_found",
        }
    }
}

fn metadata_for(event: &CanonicalEvent) -> TransitionMetadata {
    TransitionMetadata {
        gateway_payment_id: event.gateway_payment_id.clone(),
        payment_mode: event.payment_mode.clone(),
        raw: Some(event.raw_payload.clone()),
    }
}

/// Apply `event` to `transaction` and its entitlement atomically.
///
/// Nothing here talks to the network. Side effects are the caller's job and
/// only follow a `Granted` outcome.
pub fn apply_canonical_event(
    conn: &mut Connection,
    config: &Config,
    transaction: &Transaction,
    event: &CanonicalEvent,
    now: i64,
) -> Result<ApplyOutcome> {
    let Some(target) = TransactionStatus::from_verified(event.verified_status) else {
        return Ok(ApplyOutcome::Ignored);
    };

    // Refunds may be partial, so only payment events are held to the total
    if event.verified_status != VerifiedStatus::Refunded {
        if let Some(received) = event.amount {
            if received != transaction.total_amount {
                return Ok(ApplyOutcome::AmountMismatch {
                    expected: transaction.total_amount,
                    received,
                });
            }
        }
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let from = match queries::transition_transaction_status(
        &tx,
        &transaction.id,
        target,
        &metadata_for(event),
    )? {
        TransitionOutcome::Applied { from } => from,
        TransitionOutcome::AlreadyProcessed { current } => {
            return Ok(ApplyOutcome::AlreadyProcessed { current });
        }
        TransitionOutcome::NotFound => return Ok(ApplyOutcome::NotFound),
    };

    let outcome = match target {
        TransactionStatus::Completed => {
            let granted = grant_pro_in_tx(&tx, config, transaction, now)?;
            if config.invoice_webhook_url.is_some() {
                queries::set_invoice_status(&tx, &transaction.id, InvoiceStatus::Pending)?;
            }
            granted
        }
        TransactionStatus::Refunded if from == TransactionStatus::Completed => {
            revoke_pro_in_tx(&tx, config, transaction, now)?
        }
        to => ApplyOutcome::Transitioned { from, to },
    };

    tx.commit()?;
    Ok(outcome)
}

fn grant_pro_in_tx(
    conn: &Connection,
    config: &Config,
    transaction: &Transaction,
    now: i64,
) -> Result<ApplyOutcome> {
    let period = config.subscription_period_secs();
    let pro_limit = config.quotas.limit_for(Tier::Pro);

    let existing = queries::get_entitlement(conn, &transaction.user_id, &transaction.solution_id)?;

    let (from_tier, tier_expires_at) = match existing {
        Some(ent) => {
            let from_tier = ent.effective_tier(now);
            // Renewals stack on top of time already paid for
            let base = match (from_tier, ent.tier_expires_at) {
                (Tier::Pro, Some(expires)) => expires.max(now),
                _ => now,
            };
            let tier_expires_at = base + period;

            if ent.token.is_none() {
                queries::assign_token_if_missing(conn, &ent.id, &generate_token())?;
            }
            queries::grant_pro(
                conn,
                &ent.id,
                tier_expires_at,
                pro_limit,
                transaction.user_email.as_deref(),
            )?;
            (from_tier, tier_expires_at)
        }
        None => {
            let tier_expires_at = now + period;
            queries::insert_entitlement_if_absent(
                conn,
                &CreateEntitlement {
                    user_id: transaction.user_id.clone(),
                    user_email: transaction.user_email.clone(),
                    solution_id: transaction.solution_id.clone(),
                    tier: Tier::Pro,
                    token: generate_token(),
                    quota_daily_limit: pro_limit,
                    tier_expires_at: Some(tier_expires_at),
                },
            )?;
            // A buyer is an identified user, so a first purchase starts from `registered`
            (Tier::Registered, tier_expires_at)
        }
    };

    let action = if from_tier == Tier::Pro {
        SubscriptionAction::Renew
    } else {
        SubscriptionAction::Upgrade
    };

    queries::record_subscription_event(
        conn,
        &CreateSubscriptionEvent {
            user_id: &transaction.user_id,
            solution_id: &transaction.solution_id,
            from_tier,
            to_tier: Tier::Pro,
            action,
            transaction_id: Some(&transaction.id),
            tier_expires_at: Some(tier_expires_at),
        },
    )?;

    Ok(ApplyOutcome::Granted {
        action,
        from_tier,
        tier_expires_at,
    })
}

fn revoke_pro_in_tx(
    conn: &Connection,
    config: &Config,
    transaction: &Transaction,
    now: i64,
) -> Result<ApplyOutcome> {
    let Some(ent) = queries::get_entitlement(conn, &transaction.user_id, &transaction.solution_id)?
    else {
        return Ok(ApplyOutcome::Refunded { downgraded: false });
    };

    let downgraded = queries::revoke_pro(
        conn,
        &ent.id,
        config.quotas.limit_for(Tier::Registered),
    )?;

    queries::record_subscription_event(
        conn,
        &CreateSubscriptionEvent {
            user_id: &transaction.user_id,
            solution_id: &transaction.solution_id,
            from_tier: ent.effective_tier(now),
            to_tier: Tier::Registered,
            action: SubscriptionAction::Refund,
            transaction_id: Some(&transaction.id),
            tier_expires_at: None,
        },
    )?;

    Ok(ApplyOutcome::Refunded { downgraded })
}

/// Apply a verified event and kick off whatever side effects it earned.
///
/// Used by the webhook path and by manual reconciliation.
pub async fn process_event(
    state: &AppState,
    transaction: &Transaction,
    event: &CanonicalEvent,
) -> Result<ApplyOutcome> {
    let now = chrono::Utc::now().timestamp();
    let mut conn = state.db.get()?;
    let outcome = apply_canonical_event(&mut conn, &state.config, transaction, event, now)?;

    match outcome {
        ApplyOutcome::Granted {
            action,
            from_tier,
            tier_expires_at,
        } => {
            tracing::info!(
                "Granted pro: transaction={}, user={}, solution={}, {} from {}, expires_at={}",
                transaction.id,
                transaction.user_id,
                transaction.solution_id,
                action,
                from_tier,
                tier_expires_at
            );
            // Re-read so the invoice carries the payment ID the event just stored
            let committed = queries::get_transaction(&conn, &transaction.id)?
                .unwrap_or_else(|| transaction.clone());
            spawn_purchase_email(
                state.http_client.clone(),
                state.config.email_webhook_url.clone(),
                PurchaseEmailEvent::new(&committed, tier_expires_at),
            );
            spawn_invoice(
                state.http_client.clone(),
                state.config.invoice_webhook_url.clone(),
                state.db.clone(),
                InvoiceEvent::new(&committed),
            );
        }
        ApplyOutcome::Refunded { downgraded } => {
            tracing::info!(
                "Refunded: transaction={}, user={}, solution={}, downgraded={}",
                transaction.id,
                transaction.user_id,
                transaction.solution_id,
                downgraded
            );
        }
        ApplyOutcome::Transitioned { from, to } => {
            tracing::info!("Transaction {} moved {} -> {}", transaction.id, from, to);
        }
        ApplyOutcome::AlreadyProcessed { current } => {
            tracing::debug!(
                "Transaction {} already {}; event ignored",
                transaction.id,
                current
            );
            if current == TransactionStatus::Completed {
                retry_pending_invoice(state, &conn, &transaction.id)?;
            }
        }
        ApplyOutcome::AmountMismatch { expected, received } => {
            tracing::error!(
                "Amount mismatch on transaction {}: ledger {} {}, gateway reported {}. Not applied.",
                transaction.id,
                expected,
                transaction.currency,
                received
            );
        }
        ApplyOutcome::Ignored => {
            tracing::warn!(
                "Gateway reported an unknown status for transaction {}; nothing changed",
                transaction.id
            );
        }
        ApplyOutcome::NotFound => {
            tracing::warn!("Transaction {} vanished before the update", transaction.id);
        }
    }

    Ok(outcome)
}

/// A replay is the only chance to redo an invoice that never got through.
fn retry_pending_invoice(state: &AppState, conn: &Connection, transaction_id: &str) -> Result<()> {
    if state.config.invoice_webhook_url.is_none() {
        return Ok(());
    }
    let Some(txn) = queries::get_transaction(conn, transaction_id)? else {
        return Ok(());
    };
    if txn.invoice_status == InvoiceStatus::Pending {
        tracing::info!("Retrying pending invoice for transaction {}", txn.id);
        spawn_invoice(
            state.http_client.clone(),
            state.config.invoice_webhook_url.clone(),
            state.db.clone(),
            InvoiceEvent::new(&txn),
        );
    }
    Ok(())
}
