use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::PgConnection;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Snapshots are not supported for table '{0}'")]
    UnsupportedTable(String),
    #[error("{table} {id} not found")]
    TargetMissing { table: String, id: Uuid },
}

#[derive(Debug, Clone)]
pub struct EvidenceRequest {
    pub approval_instance_id: Uuid,
    pub target_table: String,
    pub target_id: Uuid,
    pub captured_by: Option<Uuid>,
    pub force_regenerate: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EvidenceSnapshot {
    pub id: Uuid,
    pub approval_instance_id: Uuid,
    pub target_table: String,
    pub target_id: Uuid,
    pub captured_by: Option<Uuid>,
    pub snapshot: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvidenceOutcome {
    pub created: bool,
    pub snapshot: Option<EvidenceSnapshot>,
}

/// Captures what a document looked like when it entered approval.
#[async_trait]
pub trait EvidenceSnapshotService: Send + Sync {
    async fn create_for_approval(
        &self,
        conn: &mut PgConnection,
        request: EvidenceRequest,
    ) -> Result<EvidenceOutcome, EvidenceError>;
}

/// Stores the document row and the approval steps as JSON in
/// `approval_evidence_snapshots`, one snapshot per approval instance.
pub struct PgEvidenceSnapshotService {
    tables: HashSet<String>,
}

impl PgEvidenceSnapshotService {
    /// `tables` bounds which document tables may be read; table names are interpolated
    /// into SQL and must never come from request input unchecked.
    pub fn new(tables: impl IntoIterator<Item = String>) -> Self {
        Self {
            tables: tables.into_iter().collect(),
        }
    }

    async fn existing(
        conn: &mut PgConnection,
        approval_instance_id: Uuid,
    ) -> Result<Option<EvidenceSnapshot>, sqlx::Error> {
        sqlx::query_as::<_, EvidenceSnapshot>(
            r#"
            SELECT id, approval_instance_id, target_table, target_id, captured_by, snapshot, created_at
            FROM approval_evidence_snapshots
            WHERE approval_instance_id = $1
            "#,
        )
        .bind(approval_instance_id)
        .fetch_optional(conn)
        .await
    }
}

#[async_trait]
impl EvidenceSnapshotService for PgEvidenceSnapshotService {
    async fn create_for_approval(
        &self,
        conn: &mut PgConnection,
        request: EvidenceRequest,
    ) -> Result<EvidenceOutcome, EvidenceError> {
        if !self.tables.contains(&request.target_table) {
            return Err(EvidenceError::UnsupportedTable(request.target_table));
        }

        if !request.force_regenerate {
            if let Some(snapshot) = Self::existing(&mut *conn, request.approval_instance_id).await? {
                return Ok(EvidenceOutcome {
                    created: false,
                    snapshot: Some(snapshot),
                });
            }
        }

        let document: Option<JsonValue> = sqlx::query_scalar(&format!(
            "SELECT to_jsonb(t) FROM {} t WHERE t.id = $1",
            request.target_table
        ))
        .bind(request.target_id)
        .fetch_optional(&mut *conn)
        .await?;

        let document = document.ok_or_else(|| EvidenceError::TargetMissing {
            table: request.target_table.clone(),
            id: request.target_id,
        })?;

        let steps: Option<JsonValue> = sqlx::query_scalar(
            r#"
            SELECT jsonb_agg(to_jsonb(s) ORDER BY s.step_order, s.position)
            FROM approval_steps s
            WHERE s.instance_id = $1
            "#,
        )
        .bind(request.approval_instance_id)
        .fetch_one(&mut *conn)
        .await?;

        let snapshot = serde_json::json!({
            "document": document,
            "approval_steps": steps.unwrap_or_else(|| JsonValue::Array(Vec::new())),
            "captured_at": Utc::now().to_rfc3339(),
        });

        let stored = sqlx::query_as::<_, EvidenceSnapshot>(
            r#"
            INSERT INTO approval_evidence_snapshots
                (id, approval_instance_id, target_table, target_id, captured_by, snapshot)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (approval_instance_id) DO UPDATE
                SET snapshot = EXCLUDED.snapshot,
                    captured_by = EXCLUDED.captured_by,
                    created_at = NOW()
            RETURNING id, approval_instance_id, target_table, target_id, captured_by, snapshot, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.approval_instance_id)
        .bind(&request.target_table)
        .bind(request.target_id)
        .bind(request.captured_by)
        .bind(&snapshot)
        .fetch_one(&mut *conn)
        .await?;

        tracing::debug!(
            "Captured evidence snapshot {} for approval {}",
            stored.id,
            stored.approval_instance_id
        );

        Ok(EvidenceOutcome {
            created: true,
            snapshot: Some(stored),
        })
    }
}
