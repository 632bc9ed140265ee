use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{PgConnection, PgPool};
use std::net::IpAddr;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AuditResult<T> = Result<T, AuditError>;

/// Audit sink for approval activity. Called inside the caller's transaction so the
/// record commits (or rolls back) together with the state change it describes.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn log(&self, conn: &mut PgConnection, entry: AuditEntry) -> AuditResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    ApprovalCreate,
    StepApprove,
    StepReject,
    StepAutoCancel,
    InstanceTransition,
    DocumentStatusSync,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApprovalCreate => "approval_create",
            Self::StepApprove => "approval_step_approve",
            Self::StepReject => "approval_step_reject",
            Self::StepAutoCancel => "approval_step_auto_cancel",
            Self::InstanceTransition => "approval_instance_transition",
            Self::DocumentStatusSync => "approval_document_sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditSeverity {
    #[default]
    Info,
    Warning,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
        }
    }
}

/// Request metadata carried from the transport layer into audit records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditContext {
    pub ip_address: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub request_id: Option<Uuid>,
}

/// One audit record, assembled with builder methods
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: Option<Uuid>,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Option<Uuid>,
    pub changes: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
    pub context: AuditContext,
    pub severity: AuditSeverity,
}

impl AuditEntry {
    pub fn new(action: AuditAction, resource_type: impl Into<String>) -> Self {
        Self {
            user_id: None,
            action,
            resource_type: resource_type.into(),
            resource_id: None,
            changes: None,
            metadata: None,
            context: AuditContext::default(),
            severity: AuditSeverity::default(),
        }
    }

    pub fn user(mut self, id: Option<Uuid>) -> Self {
        self.user_id = id;
        self
    }

    pub fn resource(mut self, id: Uuid) -> Self {
        self.resource_id = Some(id);
        self
    }

    /// Record a status change as `{"status": {"old": ..., "new": ...}}`
    pub fn status_change<T: Serialize>(mut self, old: &T, new: &T) -> Result<Self, serde_json::Error> {
        let change = FieldChange::new(old, new)?;
        self.changes = Some(serde_json::json!({ "status": change }));
        Ok(self)
    }

    pub fn metadata_json(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn context(mut self, context: &AuditContext) -> Self {
        self.context = context.clone();
        self
    }

    pub fn warning(mut self) -> Self {
        self.severity = AuditSeverity::Warning;
        self
    }
}

/// Represents changes made during an update operation
#[derive(Debug, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: JsonValue,
    pub new: JsonValue,
}

impl FieldChange {
    pub fn new<T: Serialize>(old: &T, new: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            old: serde_json::to_value(old)?,
            new: serde_json::to_value(new)?,
        })
    }
}

/// Audit logging backed by the `audit_logs` table
pub struct AuditService {
    pool: PgPool,
}

impl AuditService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Audit trail of an approval instance and all of its steps
    pub async fn get_approval_history(&self, instance_id: Uuid) -> AuditResult<Vec<AuditLogEntry>> {
        let entries = sqlx::query_as(
            r#"
            SELECT
                id, user_id, ip_address, user_agent, action, resource_type, resource_id,
                changes, metadata, request_id, severity, created_at
            FROM audit_logs
            WHERE (resource_type = 'approval_instances' AND resource_id = $1)
               OR (resource_type = 'approval_steps' AND metadata->>'instance_id' = $1::text)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[async_trait]
impl AuditLogger for AuditService {
    async fn log(&self, conn: &mut PgConnection, entry: AuditEntry) -> AuditResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                user_id, ip_address, user_agent, action, resource_type, resource_id,
                changes, metadata, request_id, severity
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.context.ip_address.map(|ip| ip.to_string()))
        .bind(&entry.context.user_agent)
        .bind(entry.action.as_str())
        .bind(&entry.resource_type)
        .bind(entry.resource_id)
        .bind(&entry.changes)
        .bind(&entry.metadata)
        .bind(entry.context.request_id)
        .bind(entry.severity.as_str())
        .execute(conn)
        .await?;

        Ok(())
    }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<Uuid>,
    pub changes: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
    pub request_id: Option<Uuid>,
    pub severity: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}
