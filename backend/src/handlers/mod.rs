use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;
use std::sync::Arc;

use crate::database;
use crate::AppState;

pub mod approvals;

pub use approvals::approval_routes;

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    if database::health_check(&state.db_pool).await {
        (StatusCode::OK, Json(json!({"status": "healthy", "service": "erp-approvals", "database": "up"})))
    } else {
        tracing::warn!("Health check failed: database unreachable");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unhealthy", "service": "erp-approvals", "database": "down"})),
        )
    }
}
