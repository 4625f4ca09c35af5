use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::db::AppState;
use crate::util::{extract_bearer_token, secure_eq};

/// Which shared key a route group is guarded by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiScope {
    Internal,
    Operator,
}

impl ApiScope {
    fn configured_key(self, state: &AppState) -> Option<&str> {
        match self {
            ApiScope::Internal => state.config.internal_api_key.as_deref(),
            ApiScope::Operator => state.config.operator_api_key.as_deref(),
        }
    }
}

/// Check the bearer token against the scope's key.
///
/// Without a configured key, dev mode lets requests through and anything
/// else refuses them.
fn authenticate(state: &AppState, scope: ApiScope, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = scope.configured_key(state) else {
        if state.config.dev_mode {
            return Ok(());
        }
        tracing::warn!("{:?} API called but no key is configured", scope);
        return Err(StatusCode::UNAUTHORIZED);
    };

    let provided = extract_bearer_token(headers).ok_or(StatusCode::UNAUTHORIZED)?;
    if secure_eq(expected, provided) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

pub async fn internal_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authenticate(&state, ApiScope::Internal, request.headers())?;
    request.extensions_mut().insert(ApiScope::Internal);
    Ok(next.run(request).await)
}

pub async fn operator_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authenticate(&state, ApiScope::Operator, request.headers())?;
    request.extensions_mut().insert(ApiScope::Operator);
    Ok(next.run(request).await)
}
