use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use erp_shared::{ActOutcome, ApprovalAction, ApprovalInstance, ApprovalInstanceWithSteps};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiResult, AppError, ValidationBuilder};
use crate::services::audit::{AuditContext, AuditLogEntry};
use crate::workflows::{ActOptions, CreateOptions, SubmitOutcome, SubmitRequest};
use crate::AppState;

const MAX_REASON_LEN: usize = 2000;

#[derive(Debug, Deserialize)]
pub struct CreateApprovalRequest {
    pub flow_type: String,
    pub target_table: String,
    pub target_id: Uuid,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct SubmitApprovalRequest {
    pub flow_type: String,
    pub target_table: String,
    pub target_id: Uuid,
    pub payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ActRequest {
    pub action: ApprovalAction,
    pub reason: Option<String>,
}

pub fn approval_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_approval))
        .route("/submit", post(submit_approval))
        .route("/pending", get(list_pending))
        .route("/:id", get(get_approval))
        .route("/:id/act", post(act_on_approval))
        .route("/:id/audit", get(get_approval_audit))
}

fn validate_target(state: &AppState, flow_type: &str, target_table: &str) -> ApiResult<()> {
    if let Some(err) = ValidationBuilder::new()
        .check(flow_type.trim().is_empty(), "flow_type", "flow_type is required")
        .check(target_table.trim().is_empty(), "target_table", "target_table is required")
        .build()
    {
        return Err(err);
    }

    if !state.engine.synchronizer().supports(target_table) {
        return Err(AppError::BadRequest(format!("Unsupported target table '{}'", target_table)));
    }

    Ok(())
}

/// Request metadata recorded with audit entries
fn audit_context(headers: &HeaderMap) -> AuditContext {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    AuditContext {
        ip_address: header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(|ip| ip.trim().parse().ok()),
        user_agent: header("user-agent").map(str::to_string),
        request_id: header("x-request-id").and_then(|v| Uuid::parse_str(v).ok()),
    }
}

async fn create_approval(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(req): Json<CreateApprovalRequest>,
) -> ApiResult<(StatusCode, Json<ApprovalInstance>)> {
    validate_target(&state, &req.flow_type, &req.target_table)?;

    let instance = state
        .engine
        .create_approval_for(
            &req.flow_type,
            &req.target_table,
            req.target_id,
            &req.payload,
            CreateOptions {
                created_by: Some(auth.user_id),
                now: None,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(instance)))
}

async fn submit_approval(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(req): Json<SubmitApprovalRequest>,
) -> ApiResult<(StatusCode, Json<SubmitOutcome<Value>>)> {
    validate_target(&state, &req.flow_type, &req.target_table)?;

    let mutator = state.engine.synchronizer().mutator(&req.target_table)?.clone();
    let target_id = req.target_id;

    let outcome = state
        .engine
        .submit_approval_with_update(
            SubmitRequest {
                flow_type: req.flow_type,
                target_table: req.target_table,
                target_id,
                payload: req.payload,
                created_by: Some(auth.user_id),
            },
            move |conn| Box::pin(async move { mutator.mark_submitted(conn, target_id).await }),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn get_approval(
    State(state): State<Arc<AppState>>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ApprovalInstanceWithSteps>> {
    let approval = state.engine.get_instance(id).await?;
    Ok(Json(approval))
}

async fn list_pending(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> ApiResult<Json<Vec<ApprovalInstance>>> {
    let pending = state.engine.pending_for(auth.user_id, &auth.group_set()).await?;
    Ok(Json(pending))
}

async fn act_on_approval(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<ActRequest>,
) -> ApiResult<Json<ActOutcome>> {
    let reason = req.reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());

    if let Some(err) = ValidationBuilder::new()
        .check(
            reason.as_ref().is_some_and(|r| r.chars().count() > MAX_REASON_LEN),
            "reason",
            "reason must be at most 2000 characters",
        )
        .build()
    {
        return Err(err);
    }

    let options = ActOptions {
        reason,
        actor_group_ids: auth.groups.clone(),
        audit_context: Some(audit_context(&headers)),
        ..Default::default()
    };

    let outcome = state.engine.act(id, auth.user_id, req.action, options).await?;
    Ok(Json(outcome))
}

async fn get_approval_audit(
    State(state): State<Arc<AppState>>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<AuditLogEntry>>> {
    // 404 for unknown instances rather than an empty trail
    state.engine.get_instance(id).await?;

    let entries = state.audit.get_approval_history(id).await?;
    Ok(Json(entries))
}
