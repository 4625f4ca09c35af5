use axum::extract::State;
use serde::Deserialize;

use crate::db::AppState;
use crate::error::Result;
use crate::extractors::Json;
use crate::models::{ReconciliationFilters, ReconciliationReport};
use crate::reconcile::{self, ResolveResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub filters: ReconciliationFilters,
}

pub async fn report(
    State(state): State<AppState>,
    Json(req): Json<ReportRequest>,
) -> Result<Json<ReconciliationReport>> {
    let report = reconcile::run_report(&state, &req.start_date, &req.end_date, &req.filters).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub transaction_id: String,
}

pub async fn resolve(
    State(state): State<AppState>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<ResolveResult>> {
    let result = reconcile::resolve_transaction(&state, &req.transaction_id).await?;
    Ok(Json(result))
}
