// Document status synchronization - writes approval outcomes back to the
// document an instance governs

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use erp_shared::ApprovalOutcome;
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use super::error::{ApprovalError, ApprovalResult};

/// Writes approval state into one document table.
#[async_trait]
pub trait DocumentMutator: Send + Sync {
    /// Persist a terminal approval outcome on the document.
    async fn apply_outcome(
        &self,
        conn: &mut PgConnection,
        target_id: Uuid,
        outcome: ApprovalOutcome,
        actor: Option<Uuid>,
    ) -> ApprovalResult<()>;

    /// Move the document into its awaiting-approval state; returns the updated row.
    async fn mark_submitted(&self, conn: &mut PgConnection, target_id: Uuid) -> ApprovalResult<Value>;
}

/// Status words a document type uses for approval states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusVocabulary {
    pub approved: &'static str,
    pub rejected: &'static str,
    pub submitted: &'static str,
}

impl StatusVocabulary {
    pub const DOCUMENT: Self = Self {
        approved: "approved",
        rejected: "rejected",
        submitted: "pending_approval",
    };

    pub const SUBMISSION: Self = Self {
        approved: "approved",
        rejected: "rejected",
        submitted: "submitted",
    };

    pub fn for_outcome(&self, outcome: ApprovalOutcome) -> &'static str {
        match outcome {
            ApprovalOutcome::Approved => self.approved,
            ApprovalOutcome::Rejected => self.rejected,
        }
    }
}

/// Documents whose approval state is a single status column.
#[derive(Debug, Clone)]
pub struct StatusColumnMutator {
    table: &'static str,
    column: &'static str,
    vocabulary: StatusVocabulary,
}

impl StatusColumnMutator {
    pub fn new(table: &'static str, column: &'static str, vocabulary: StatusVocabulary) -> Self {
        Self {
            table,
            column,
            vocabulary,
        }
    }

    async fn set_status(&self, conn: &mut PgConnection, target_id: Uuid, value: &str) -> ApprovalResult<Value> {
        let sql = format!(
            "UPDATE {table} AS t SET {column} = $2, updated_at = NOW() WHERE t.id = $1 RETURNING to_jsonb(t)",
            table = self.table,
            column = self.column
        );

        let row: Option<Value> = sqlx::query_scalar(&sql)
            .bind(target_id)
            .bind(value)
            .fetch_optional(conn)
            .await?;

        row.ok_or_else(|| ApprovalError::TargetNotFound {
            table: self.table.to_string(),
            id: target_id,
        })
    }
}

#[async_trait]
impl DocumentMutator for StatusColumnMutator {
    async fn apply_outcome(
        &self,
        conn: &mut PgConnection,
        target_id: Uuid,
        outcome: ApprovalOutcome,
        _actor: Option<Uuid>,
    ) -> ApprovalResult<()> {
        self.set_status(conn, target_id, self.vocabulary.for_outcome(outcome))
            .await
            .map(|_| ())
    }

    async fn mark_submitted(&self, conn: &mut PgConnection, target_id: Uuid) -> ApprovalResult<Value> {
        self.set_status(conn, target_id, self.vocabulary.submitted).await
    }
}

/// Expenses keep a transition log next to their status, including the settlement status
/// at the time of the change.
#[derive(Debug, Clone, Default)]
pub struct ExpenseMutator;

impl ExpenseMutator {
    async fn transition(
        &self,
        conn: &mut PgConnection,
        expense_id: Uuid,
        to_status: &str,
        actor: Option<Uuid>,
        reason: &str,
    ) -> ApprovalResult<Value> {
        let current: Option<(String, String)> =
            sqlx::query_as("SELECT status, settlement_status FROM expenses WHERE id = $1 FOR UPDATE")
                .bind(expense_id)
                .fetch_optional(&mut *conn)
                .await?;

        let (from_status, settlement_status) = current.ok_or_else(|| ApprovalError::TargetNotFound {
            table: "expenses".to_string(),
            id: expense_id,
        })?;

        let row: Value = sqlx::query_scalar(
            "UPDATE expenses AS t SET status = $2, updated_at = NOW() WHERE t.id = $1 RETURNING to_jsonb(t)",
        )
        .bind(expense_id)
        .bind(to_status)
        .fetch_one(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO expense_state_transitions
                (id, expense_id, from_status, to_status, from_settlement_status, to_settlement_status, actor_id, reason)
            VALUES ($1, $2, $3, $4, $5, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(expense_id)
        .bind(&from_status)
        .bind(to_status)
        .bind(&settlement_status)
        .bind(actor)
        .bind(reason)
        .execute(&mut *conn)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl DocumentMutator for ExpenseMutator {
    async fn apply_outcome(
        &self,
        conn: &mut PgConnection,
        target_id: Uuid,
        outcome: ApprovalOutcome,
        actor: Option<Uuid>,
    ) -> ApprovalResult<()> {
        let status = StatusVocabulary::DOCUMENT.for_outcome(outcome);
        let reason = format!("approval {}", outcome.as_str());
        self.transition(conn, target_id, status, actor, &reason).await.map(|_| ())
    }

    async fn mark_submitted(&self, conn: &mut PgConnection, target_id: Uuid) -> ApprovalResult<Value> {
        self.transition(conn, target_id, StatusVocabulary::DOCUMENT.submitted, None, "submitted for approval")
            .await
    }
}

/// Registry of document mutators keyed by target table.
#[derive(Clone, Default)]
pub struct TargetStatusSynchronizer {
    mutators: HashMap<String, Arc<dyn DocumentMutator>>,
}

impl TargetStatusSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registrations for the ERP's approvable documents.
    pub fn with_defaults() -> Self {
        let mut sync = Self::new();

        for table in ["estimates", "invoices", "purchase_orders", "vendor_invoices", "vendor_quotes"] {
            sync.register(table, StatusColumnMutator::new(table, "status", StatusVocabulary::DOCUMENT));
        }
        sync.register("expenses", ExpenseMutator);
        sync.register(
            "time_entries",
            StatusColumnMutator::new("time_entries", "approval_status", StatusVocabulary::SUBMISSION),
        );
        sync.register(
            "leave_requests",
            StatusColumnMutator::new("leave_requests", "status", StatusVocabulary::SUBMISSION),
        );

        sync
    }

    pub fn register(&mut self, table: impl Into<String>, mutator: impl DocumentMutator + 'static) {
        self.mutators.insert(table.into(), Arc::new(mutator));
    }

    pub fn supports(&self, table: &str) -> bool {
        self.mutators.contains_key(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.mutators.keys().map(String::as_str)
    }

    pub fn mutator(&self, table: &str) -> ApprovalResult<&Arc<dyn DocumentMutator>> {
        self.mutators
            .get(table)
            .ok_or_else(|| ApprovalError::UnknownTargetTable(table.to_string()))
    }

    pub async fn apply(
        &self,
        conn: &mut PgConnection,
        table: &str,
        target_id: Uuid,
        outcome: ApprovalOutcome,
        actor: Option<Uuid>,
    ) -> ApprovalResult<()> {
        self.mutator(table)?
            .apply_outcome(conn, target_id, outcome, actor)
            .await?;

        tracing::debug!("Synchronized {} {} to {}", table, target_id, outcome.as_str());
        Ok(())
    }
}
