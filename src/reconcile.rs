//! Reconciliation: compare the ledger against what each provider reports.
//!
//! Reports never write canonical status. The provider's answer is cached on
//! the row (`provider_status`, `provider_checked_at`) and mismatches are
//! listed for an operator, who can push one through [`resolve_transaction`].

use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::db::{AppState, queries};
use crate::error::{AppError, OptionExt, Result, msg};
use crate::models::{
    Discrepancy, DiscrepancyKind, ReconciliationFilters, ReconciliationReport, Transaction,
    TransactionFilters, TransactionStatus, VerifiedStatus,
};
use crate::payments::{CanonicalEvent, GatewayRegistry, ProviderStatus};
use crate::updater;
use crate::util::date_range_bounds;

const UNKNOWN_KEY: &str = "unknown";

enum LiveCheck {
    Checked(ProviderStatus),
    /// No adapter, or no credentials for live queries
    Skipped,
    Failed(String),
}

async fn check_provider(registry: &GatewayRegistry, transaction: &Transaction, timeout: Duration) -> LiveCheck {
    let Some(adapter) = registry.get(transaction.gateway) else {
        return LiveCheck::Skipped;
    };
    match tokio::time::timeout(timeout, adapter.query_status(transaction)).await {
        Ok(Ok(Some(status))) => LiveCheck::Checked(status),
        Ok(Ok(None)) => LiveCheck::Skipped,
        Ok(Err(e)) => LiveCheck::Failed(e.to_string()),
        Err(_) => LiveCheck::Failed(format!("timed out after {:?}", timeout)),
    }
}

fn tally(report: &mut ReconciliationReport, t: &Transaction) {
    report.total.add(&t.currency, t.total_amount);
    report
        .by_status
        .entry(t.status.to_string())
        .or_default()
        .add(&t.currency, t.total_amount);

    if t.status != TransactionStatus::Completed {
        return;
    }

    let country = t
        .billing_info
        .as_ref()
        .and_then(|b| b.country.as_deref())
        .map(|c| c.to_uppercase())
        .unwrap_or_else(|| UNKNOWN_KEY.to_string());
    let payment_mode = t
        .payment_mode
        .clone()
        .unwrap_or_else(|| UNKNOWN_KEY.to_string());

    for (breakdown, key) in [
        (&mut report.by_solution, t.solution_id.clone()),
        (&mut report.by_tier, t.tier.to_string()),
        (&mut report.by_country, country),
        (&mut report.by_payment_mode, payment_mode),
        (&mut report.by_gateway, t.gateway.to_string()),
    ] {
        breakdown.entry(key).or_default().add(&t.currency, t.total_amount);
    }
}

/// Compare one row with its provider's answer.
///
/// A provider that cannot say anything (`unknown`) only counts against rows
/// the ledger claims were paid.
fn discrepancy_for(t: &Transaction, provider: &ProviderStatus) -> Option<Discrepancy> {
    let status_agrees = match provider.status {
        VerifiedStatus::Unknown => !matches!(
            t.status,
            TransactionStatus::Completed | TransactionStatus::Refunded
        ),
        status => status.agrees_with(t.status),
    };

    let kind = if !status_agrees {
        DiscrepancyKind::StatusMismatch
    } else if t.status == TransactionStatus::Completed
        && provider.amount.is_some_and(|a| a != t.total_amount)
    {
        DiscrepancyKind::AmountMismatch
    } else {
        return None;
    };

    Some(Discrepancy {
        transaction_id: t.id.clone(),
        gateway: t.gateway,
        kind,
        ledger_status: t.status,
        provider_status: provider.status,
        provider_raw_status: provider.raw_status.clone(),
        amount: t.total_amount,
        provider_amount: provider.amount,
        currency: t.currency.clone(),
    })
}

/// Build the report for `[start_date, end_date]` (inclusive UTC dates).
pub async fn run_report(
    state: &AppState,
    start_date: &str,
    end_date: &str,
    filters: &ReconciliationFilters,
) -> Result<ReconciliationReport> {
    let (start, end) = date_range_bounds(start_date, end_date)?;

    let transactions = {
        let conn = state.db.get()?;
        queries::list_transactions(
            &conn,
            &TransactionFilters {
                start: Some(start),
                end: Some(end),
                solution_id: filters.solution_id.clone(),
                tier: filters.tier,
                country: filters.country.clone(),
                gateway: filters.gateway,
            },
        )?
    };

    let mut report = ReconciliationReport {
        start_date: start_date.to_string(),
        end_date: end_date.to_string(),
        ..Default::default()
    };
    for t in &transactions {
        tally(&mut report, t);
    }

    let registry = &state.gateways;
    let timeout = state.config.gateway_timeout;
    let checks: Vec<(Transaction, LiveCheck)> = stream::iter(transactions)
        .map(|t| async move {
            let result = check_provider(registry, &t, timeout).await;
            (t, result)
        })
        .buffer_unordered(state.config.reconcile_concurrency.max(1))
        .collect()
        .await;

    let checked_at = chrono::Utc::now().timestamp();
    let conn = state.db.get()?;
    for (t, result) in checks {
        match result {
            LiveCheck::Checked(provider) => {
                report.checked += 1;
                queries::record_provider_status(&conn, &t.id, &provider.raw_status, checked_at)?;
                if let Some(d) = discrepancy_for(&t, &provider) {
                    report.discrepancies.push(d);
                }
            }
            LiveCheck::Skipped => report.skipped += 1,
            LiveCheck::Failed(e) => {
                report.errors += 1;
                tracing::error!(
                    "Reconciliation query failed: transaction={}, gateway={}: {}",
                    t.id,
                    t.gateway,
                    e
                );
            }
        }
    }

    report
        .discrepancies
        .sort_by(|a, b| a.transaction_id.cmp(&b.transaction_id));

    tracing::info!(
        "Reconciliation {}..{}: {} rows, {} checked, {} skipped, {} errors, {} discrepancies",
        start_date,
        end_date,
        report.total.count,
        report.checked,
        report.skipped,
        report.errors,
        report.discrepancies.len()
    );

    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResult {
    pub outcome: &'static str,
    pub status: TransactionStatus,
    pub provider_status: VerifiedStatus,
}

/// Ask the provider about one transaction and, if it has a terminal answer,
/// apply it as a verified event.
pub async fn resolve_transaction(state: &AppState, transaction_id: &str) -> Result<ResolveResult> {
    let transaction = {
        let conn = state.db.get()?;
        queries::get_transaction(&conn, transaction_id)?.or_not_found(msg::TRANSACTION_NOT_FOUND)?
    };

    let adapter = state
        .gateways
        .get(transaction.gateway)
        .ok_or_else(|| AppError::BadRequest(msg::GATEWAY_NOT_CONFIGURED.into()))?;

    let timeout = state.config.gateway_timeout;
    let provider = tokio::time::timeout(timeout, adapter.query_status(&transaction))
        .await
        .map_err(|_| {
            AppError::ProviderUnavailable(format!("{} status query timed out", transaction.gateway))
        })??
        .ok_or_else(|| AppError::BadRequest(msg::LIVE_QUERY_UNAVAILABLE.into()))?;

    {
        let conn = state.db.get()?;
        queries::record_provider_status(
            &conn,
            &transaction.id,
            &provider.raw_status,
            chrono::Utc::now().timestamp(),
        )?;
    }

    let provider_status = provider.status;
    let outcome = match provider_status {
        VerifiedStatus::Success | VerifiedStatus::Failed | VerifiedStatus::Refunded => {
            let event = CanonicalEvent::from_provider(provider, &transaction);
            let outcome = updater::process_event(state, &transaction, &event).await?;
            tracing::info!(
                "Manual resolve of {}: provider {}, {}",
                transaction.id,
                provider_status,
                outcome.label()
            );
            outcome.label()
        }
        _ => "no_action",
    };

    let status = {
        let conn = state.db.get()?;
        queries::get_transaction(&conn, &transaction.id)?
            .or_not_found(msg::TRANSACTION_NOT_FOUND)?
            .status
    };

    Ok(ResolveResult {
        outcome,
        status,
        provider_status,
    })
}
