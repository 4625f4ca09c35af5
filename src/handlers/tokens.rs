use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::db::AppState;
use crate::error::{AppError, Result};
use crate::extractors::Json;
use crate::models::{DenyReason, Tier, ValidationResult};
use crate::tokens;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateTokenRequest {
    pub user_id: String,
    pub user_email: Option<String>,
    pub solution_id: String,
    pub tier: Tier,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateTokenResponse {
    pub token: String,
    pub redirect_url: String,
    pub tier: Tier,
}

pub async fn generate_token(
    State(state): State<AppState>,
    Json(req): Json<GenerateTokenRequest>,
) -> Result<Json<GenerateTokenResponse>> {
    if req.user_id.trim().is_empty() || req.solution_id.trim().is_empty() {
        return Err(AppError::BadRequest("userId and solutionId are required".into()));
    }

    let mut conn = state.db.get()?;
    let issued = tokens::issue(
        &mut conn,
        &state.config,
        &req.user_id,
        req.user_email.as_deref(),
        &req.solution_id,
        req.tier,
    )?;

    Ok(Json(GenerateTokenResponse {
        redirect_url: tokens::redirect_url(&state.config, &req.solution_id, &issued.token),
        token: issued.token,
        tier: issued.tier,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenRequest {
    #[serde(default)]
    pub token: String,
    pub solution_id: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub check_only: bool,
}

/// Always 200; a denial is a structured answer, not an error.
pub async fn validate_token(
    State(state): State<AppState>,
    Json(req): Json<ValidateTokenRequest>,
) -> Result<Json<ValidationResult>> {
    if req.token.is_empty() {
        return Ok(Json(ValidationResult::denied(
            DenyReason::InvalidToken,
            Tier::Free,
            0,
        )));
    }

    let mut conn = state.db.get()?;
    let result = tokens::validate(
        &mut conn,
        &state.config,
        &req.token,
        &req.solution_id,
        req.user_id.as_deref(),
        req.check_only,
        chrono::Utc::now().timestamp(),
    )?;
    Ok(Json(result))
}
