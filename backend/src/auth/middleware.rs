use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::jwt;
use crate::error::AppError;
use crate::AppState;

/// Authenticated caller, taken from the bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub groups: Vec<Uuid>,
}

impl AuthUser {
    pub fn group_set(&self) -> HashSet<Uuid> {
        self.groups.iter().copied().collect()
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_token(&parts.headers)
            .ok_or_else(|| AppError::Unauthorized("Missing or invalid authorization header".to_string()).into_response())?;

        let token_data = jwt::verify_jwt(&token, &state.jwt_secret)
            .map_err(|e| AppError::from(e).into_response())?;

        Ok(AuthUser {
            user_id: token_data.claims.sub,
            groups: token_data.claims.groups,
        })
    }
}

// Bearer token from the Authorization header
pub fn extract_token(headers: &axum::http::HeaderMap) -> Option<String> {
    let auth_header = headers.get("authorization")?;
    let auth_str = auth_header.to_str().ok()?;

    auth_str.strip_prefix("Bearer ").map(str::to_string)
}
