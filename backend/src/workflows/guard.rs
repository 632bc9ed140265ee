use erp_shared::ApprovalInstance;
use sqlx::PgConnection;
use uuid::Uuid;

use super::error::{ApprovalError, ApprovalResult};
use super::store::INSTANCE_COLUMNS;

/// Lock an instance row for the rest of the transaction.
///
/// Concurrent actions on the same instance queue here; the holder sees the latest
/// committed state of the instance and its steps.
pub async fn lock_instance(conn: &mut PgConnection, instance_id: Uuid) -> ApprovalResult<ApprovalInstance> {
    let sql = format!("SELECT {} FROM approval_instances WHERE id = $1 FOR UPDATE", INSTANCE_COLUMNS);

    sqlx::query_as::<_, ApprovalInstance>(&sql)
        .bind(instance_id)
        .fetch_optional(conn)
        .await?
        .ok_or(ApprovalError::NotFound(instance_id))
}
