// Approval instance store - persistence of instances and steps

use erp_shared::{ApprovalInstance, ApprovalStatus, ApprovalStep, StagePolicies, StepStatus};
use sqlx::{Connection, PgConnection};
use uuid::Uuid;

use super::error::{ApprovalError, ApprovalResult};
use super::policy;
use super::rules::NewStep;
use crate::database::is_unique_violation;

pub const INSTANCE_COLUMNS: &str = "id, flow_type, target_table, target_id, project_id, status, \
     current_step, stage_policy, rule_id, created_by, created_at, updated_at";

const STEP_COLUMNS: &str = "id, instance_id, step_order, approver_group_id, approver_user_id, \
     role_class, status, acted_by, acted_at, reason, created_at";

/// Everything needed to open an approval on a document.
#[derive(Debug, Clone)]
pub struct NewInstance<'a> {
    pub flow_type: &'a str,
    pub target_table: &'a str,
    pub target_id: Uuid,
    pub project_id: Option<Uuid>,
    pub rule_id: Uuid,
    pub created_by: Option<Uuid>,
    pub stage_policy: StagePolicies,
    pub steps: Vec<NewStep>,
}

/// Result of get-or-create.
#[derive(Debug, Clone)]
pub enum Created {
    New(ApprovalInstance),
    /// An open instance already existed for the document
    Existing(ApprovalInstance),
}

pub async fn fetch_instance(conn: &mut PgConnection, instance_id: Uuid) -> Result<Option<ApprovalInstance>, sqlx::Error> {
    let sql = format!("SELECT {} FROM approval_instances WHERE id = $1", INSTANCE_COLUMNS);
    sqlx::query_as::<_, ApprovalInstance>(&sql)
        .bind(instance_id)
        .fetch_optional(conn)
        .await
}

/// The open instance of a document, if any.
pub async fn find_open(
    conn: &mut PgConnection,
    flow_type: &str,
    target_table: &str,
    target_id: Uuid,
) -> Result<Option<ApprovalInstance>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM approval_instances \
         WHERE flow_type = $1 AND target_table = $2 AND target_id = $3 \
           AND status IN ('pending_qa', 'pending_exec')",
        INSTANCE_COLUMNS
    );
    sqlx::query_as::<_, ApprovalInstance>(&sql)
        .bind(flow_type)
        .bind(target_table)
        .bind(target_id)
        .fetch_optional(conn)
        .await
}

pub async fn load_steps(conn: &mut PgConnection, instance_id: Uuid) -> Result<Vec<ApprovalStep>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM approval_steps WHERE instance_id = $1 ORDER BY step_order, position",
        STEP_COLUMNS
    );
    sqlx::query_as::<_, ApprovalStep>(&sql)
        .bind(instance_id)
        .fetch_all(conn)
        .await
}

/// Get-or-create the open instance for a document.
///
/// The insert runs under a savepoint. When a concurrent creator wins the unique index on
/// open instances, the savepoint is rolled back and the winner is returned.
pub async fn create(conn: &mut PgConnection, new: NewInstance<'_>) -> ApprovalResult<Created> {
    if let Some(existing) = find_open(&mut *conn, new.flow_type, new.target_table, new.target_id).await? {
        return Ok(Created::Existing(existing));
    }

    if new.flow_type == "expense" && !policy::has_qa_before_exec(&new.steps) {
        return Err(ApprovalError::ExpenseQaStageRequired);
    }

    let current_step = policy::first_stage(&new.steps)
        .ok_or_else(|| ApprovalError::InvalidRule("approval template has no steps".to_string()))?;
    let status = policy::pending_status(&new.steps, current_step);

    let mut savepoint = conn.begin().await?;
    match insert_rows(&mut *savepoint, &new, status, current_step).await {
        Ok(instance) => {
            savepoint.commit().await?;
            Ok(Created::New(instance))
        }
        Err(e) if is_unique_violation(&e) => {
            savepoint.rollback().await?;
            tracing::debug!(
                "Lost approval creation race for {} {}; re-reading",
                new.target_table,
                new.target_id
            );

            // The winner can close before this re-read. Under SERIALIZABLE an invisible winner
            // fails the insert with 40001 instead, which the engine maps to CreationConflict.
            match find_open(&mut *conn, new.flow_type, new.target_table, new.target_id).await? {
                Some(winner) => Ok(Created::Existing(winner)),
                None => Err(ApprovalError::CreationConflict),
            }
        }
        Err(e) => Err(e.into()),
    }
}

async fn insert_rows(
    conn: &mut PgConnection,
    new: &NewInstance<'_>,
    status: ApprovalStatus,
    current_step: i32,
) -> Result<ApprovalInstance, sqlx::Error> {
    let sql = format!(
        "INSERT INTO approval_instances \
             (id, flow_type, target_table, target_id, project_id, status, current_step, stage_policy, rule_id, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING {}",
        INSTANCE_COLUMNS
    );

    let instance = sqlx::query_as::<_, ApprovalInstance>(&sql)
        .bind(Uuid::new_v4())
        .bind(new.flow_type)
        .bind(new.target_table)
        .bind(new.target_id)
        .bind(new.project_id)
        .bind(status)
        .bind(current_step)
        .bind(&new.stage_policy)
        .bind(new.rule_id)
        .bind(new.created_by)
        .fetch_one(&mut *conn)
        .await?;

    for (position, step) in new.steps.iter().enumerate() {
        let step_status = StepStatus::pending_for(policy::pending_status(&new.steps, step.step_order));

        sqlx::query(
            r#"
            INSERT INTO approval_steps
                (id, instance_id, step_order, position, approver_group_id, approver_user_id, role_class, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(instance.id)
        .bind(step.step_order)
        .bind(position as i32)
        .bind(step.approver_group_id)
        .bind(step.approver_user_id)
        .bind(step.role_class)
        .bind(step_status)
        .execute(&mut *conn)
        .await?;
    }

    Ok(instance)
}

/// Record a vote, only if the step is still pending.
pub async fn record_vote(
    conn: &mut PgConnection,
    step_id: Uuid,
    status: StepStatus,
    actor: Uuid,
    reason: Option<&str>,
) -> ApprovalResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE approval_steps
        SET status = $2, acted_by = $3, acted_at = NOW(), reason = $4
        WHERE id = $1 AND status IN ('pending_qa', 'pending_exec')
        "#,
    )
    .bind(step_id)
    .bind(status)
    .bind(actor)
    .bind(reason)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApprovalError::StepAlreadyProcessed);
    }

    Ok(())
}

/// Cancel still-pending steps. Returns the ids actually cancelled.
pub async fn cancel_steps(conn: &mut PgConnection, step_ids: &[Uuid]) -> Result<Vec<Uuid>, sqlx::Error> {
    if step_ids.is_empty() {
        return Ok(Vec::new());
    }

    sqlx::query_scalar(
        r#"
        UPDATE approval_steps
        SET status = 'cancelled', acted_at = NOW()
        WHERE id = ANY($1) AND status IN ('pending_qa', 'pending_exec')
        RETURNING id
        "#,
    )
    .bind(step_ids)
    .fetch_all(conn)
    .await
}

pub async fn update_instance(
    conn: &mut PgConnection,
    instance_id: Uuid,
    status: ApprovalStatus,
    current_step: Option<i32>,
) -> Result<ApprovalInstance, sqlx::Error> {
    let sql = format!(
        "UPDATE approval_instances SET status = $2, current_step = $3, updated_at = NOW() \
         WHERE id = $1 RETURNING {}",
        INSTANCE_COLUMNS
    );
    sqlx::query_as::<_, ApprovalInstance>(&sql)
        .bind(instance_id)
        .bind(status)
        .bind(current_step)
        .fetch_one(conn)
        .await
}

/// Open instances where `user_id` holds an actionable step in the current stage and has
/// not voted in it yet.
pub async fn list_actionable(
    conn: &mut PgConnection,
    user_id: Uuid,
    group_ids: &[Uuid],
) -> Result<Vec<ApprovalInstance>, sqlx::Error> {
    sqlx::query_as::<_, ApprovalInstance>(
        r#"
        SELECT i.id, i.flow_type, i.target_table, i.target_id, i.project_id, i.status,
               i.current_step, i.stage_policy, i.rule_id, i.created_by, i.created_at, i.updated_at
        FROM approval_instances i
        WHERE i.status IN ('pending_qa', 'pending_exec')
          AND EXISTS (
              SELECT 1 FROM approval_steps s
              WHERE s.instance_id = i.id
                AND s.step_order = i.current_step
                AND s.status IN ('pending_qa', 'pending_exec')
                AND (
                    s.approver_user_id = $1
                    OR s.approver_group_id = ANY($2)
                    OR (s.approver_user_id IS NULL AND s.approver_group_id IS NULL)
                )
          )
          AND NOT EXISTS (
              SELECT 1 FROM approval_steps v
              WHERE v.instance_id = i.id
                AND v.step_order = i.current_step
                AND v.acted_by = $1
                AND v.status IN ('approved', 'rejected')
          )
        ORDER BY i.created_at ASC
        "#,
    )
    .bind(user_id)
    .bind(group_ids)
    .fetch_all(conn)
    .await
}
