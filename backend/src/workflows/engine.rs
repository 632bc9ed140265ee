// Workflow Engine - approval creation, submission and approver actions

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use erp_shared::{
    ActOutcome, ApprovalAction, ApprovalInstance, ApprovalInstanceWithSteps, ApprovalOutcome, ApprovalStatus,
    StagePolicy, StepStatus,
};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{ApprovalError, ApprovalResult};
use super::rules::{payload_uuid, JsonConditionMatcher, ResolvedRule, RuleResolver};
use super::store::{self, Created, NewInstance};
use super::sync::TargetStatusSynchronizer;
use super::transitions::{plan_transition, select_step, stage_steps};
use super::guard;
use super::policy::effective_quorum;
use crate::config::ApprovalConfig;
use crate::database;
use crate::services::audit::{AuditAction, AuditContext, AuditEntry, AuditLogger, AuditResult, AuditService};
use crate::services::evidence::{EvidenceError, EvidenceRequest, EvidenceSnapshotService, PgEvidenceSnapshotService};
use crate::services::qa_checklist::{PgQaChecklistService, QaChecklistService};

const INSTANCE_RESOURCE: &str = "approval_instances";
const STEP_RESOURCE: &str = "approval_steps";

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub created_by: Option<Uuid>,
    /// Rule effectiveness cut-off; defaults to the current time
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub flow_type: String,
    pub target_table: String,
    pub target_id: Uuid,
    /// Rule-matching payload; the updated document is used when absent
    pub payload: Option<Value>,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome<T> {
    pub updated: T,
    pub approval: ApprovalInstance,
}

#[derive(Debug, Clone, Default)]
pub struct ActOptions {
    pub reason: Option<String>,
    pub actor_group_id: Option<Uuid>,
    pub actor_group_ids: Vec<Uuid>,
    pub actor_group_account_ids: Vec<Uuid>,
    pub audit_context: Option<AuditContext>,
}

impl ActOptions {
    /// Every group the actor claims membership of.
    pub fn groups(&self) -> HashSet<Uuid> {
        self.actor_group_id
            .iter()
            .chain(&self.actor_group_ids)
            .chain(&self.actor_group_account_ids)
            .copied()
            .collect()
    }
}

/// Drives approval instances through their stages.
///
/// Every public operation runs in a single transaction; approver actions serialize on the
/// instance row lock.
pub struct WorkflowEngine {
    db_pool: PgPool,
    config: ApprovalConfig,
    resolver: RuleResolver,
    synchronizer: Arc<TargetStatusSynchronizer>,
    audit: Arc<dyn AuditLogger>,
    evidence: Arc<dyn EvidenceSnapshotService>,
    qa_checklists: Arc<dyn QaChecklistService>,
}

impl WorkflowEngine {
    /// Engine with the PostgreSQL-backed collaborators.
    pub fn new(db_pool: PgPool, config: ApprovalConfig) -> Self {
        let synchronizer = TargetStatusSynchronizer::with_defaults();
        let evidence = PgEvidenceSnapshotService::new(synchronizer.tables().map(str::to_string));
        let qa_checklists = PgQaChecklistService::with_required_items(config.qa_required_items.clone());

        Self {
            audit: Arc::new(AuditService::new(db_pool.clone())),
            db_pool,
            config,
            resolver: RuleResolver::new(Arc::new(JsonConditionMatcher)),
            synchronizer: Arc::new(synchronizer),
            evidence: Arc::new(evidence),
            qa_checklists: Arc::new(qa_checklists),
        }
    }

    #[cfg(test)]
    pub fn with_audit_logger(mut self, audit: Arc<dyn AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    #[cfg(test)]
    pub fn with_evidence_service(mut self, evidence: Arc<dyn EvidenceSnapshotService>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn synchronizer(&self) -> &Arc<TargetStatusSynchronizer> {
        &self.synchronizer
    }

    /// Open an approval for a document, or return the one already open.
    pub async fn create_approval_for(
        &self,
        flow_type: &str,
        target_table: &str,
        target_id: Uuid,
        payload: &Value,
        options: CreateOptions,
    ) -> ApprovalResult<ApprovalInstance> {
        let created = async {
            let mut tx = self.db_pool.begin().await?;
            let instance = self
                .create_approval_for_in(&mut tx, flow_type, target_table, target_id, payload, options)
                .await?;
            tx.commit().await?;
            Ok::<_, ApprovalError>(instance)
        }
        .await;

        created.map_err(|e| lost_race(e, &format!("{} {}", target_table, target_id)))
    }

    /// Same as [`create_approval_for`](Self::create_approval_for) on the caller's connection,
    /// typically inside a transaction the caller commits.
    pub async fn create_approval_for_in(
        &self,
        conn: &mut PgConnection,
        flow_type: &str,
        target_table: &str,
        target_id: Uuid,
        payload: &Value,
        options: CreateOptions,
    ) -> ApprovalResult<ApprovalInstance> {
        if let Some(existing) = store::find_open(&mut *conn, flow_type, target_table, target_id).await? {
            debug!("Approval {} already open for {} {}", existing.id, target_table, target_id);
            return Ok(existing);
        }

        let now = options.now.unwrap_or_else(Utc::now);
        let resolved = match self.resolver.resolve(&mut *conn, flow_type, payload, now).await? {
            Some(resolved) => resolved,
            None => {
                debug!("No active {} rule; using the default template", flow_type);
                ResolvedRule::from_templates(&self.config.default_template(flow_type))?
            }
        };

        let created = store::create(
            &mut *conn,
            NewInstance {
                flow_type,
                target_table,
                target_id,
                project_id: payload_uuid(payload, "project_id"),
                rule_id: resolved.rule_id,
                created_by: options.created_by,
                stage_policy: resolved.stage_policy,
                steps: resolved.steps,
            },
        )
        .await?;

        let instance = match created {
            Created::New(instance) => instance,
            Created::Existing(instance) => {
                warn!(
                    "Concurrent approval creation for {} {}; returning {}",
                    target_table, target_id, instance.id
                );
                return Ok(instance);
            }
        };

        let entry = AuditEntry::new(AuditAction::ApprovalCreate, INSTANCE_RESOURCE)
            .user(options.created_by)
            .resource(instance.id)
            .metadata_json(json!({
                "flow_type": instance.flow_type,
                "target_table": instance.target_table,
                "target_id": instance.target_id,
                "rule_id": instance.rule_id,
                "status": instance.status,
                "current_step": instance.current_step,
            }));
        self.write_audit(&mut *conn, entry).await;

        info!(
            "Created {} approval {} for {} {} ({})",
            flow_type, instance.id, target_table, target_id, instance.status
        );

        Ok(instance)
    }

    /// Run a document mutation, open its approval and capture evidence in one SERIALIZABLE
    /// transaction. Nothing is persisted if any part fails.
    ///
    /// A concurrent submit for the same document that aborts this transaction surfaces as
    /// the retryable [`ApprovalError::CreationConflict`].
    pub async fn submit_approval_with_update<T, F>(
        &self,
        request: SubmitRequest,
        update: F,
    ) -> ApprovalResult<SubmitOutcome<T>>
    where
        T: Serialize + Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, ApprovalResult<T>> + Send,
    {
        let target = format!("{} {}", request.target_table, request.target_id);
        self.submit_serializable(request, update)
            .await
            .map_err(|e| lost_race(e, &target))
    }

    async fn submit_serializable<T, F>(
        &self,
        request: SubmitRequest,
        update: F,
    ) -> ApprovalResult<SubmitOutcome<T>>
    where
        T: Serialize + Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, ApprovalResult<T>> + Send,
    {
        let mut tx = database::begin_serializable(&self.db_pool).await?;

        let updated = update(&mut *tx).await?;

        let payload = match request.payload {
            Some(payload) => payload,
            None => serde_json::to_value(&updated)?,
        };

        let approval = self
            .create_approval_for_in(
                &mut *tx,
                &request.flow_type,
                &request.target_table,
                request.target_id,
                &payload,
                CreateOptions {
                    created_by: request.created_by,
                    now: None,
                },
            )
            .await?;

        self.evidence
            .create_for_approval(
                &mut *tx,
                EvidenceRequest {
                    approval_instance_id: approval.id,
                    target_table: request.target_table.clone(),
                    target_id: request.target_id,
                    captured_by: request.created_by,
                    force_regenerate: false,
                },
            )
            .await
            .map_err(|e| match e {
                EvidenceError::Database(db) if database::is_serialization_failure(&db) => ApprovalError::Database(db),
                e => ApprovalError::collaborator("evidence_snapshot", e),
            })?;

        tx.commit().await?;

        info!(
            "Submitted {} {} for approval {}",
            request.target_table, request.target_id, approval.id
        );

        Ok(SubmitOutcome { updated, approval })
    }

    /// Approve or reject on behalf of `user_id`.
    pub async fn act(
        &self,
        instance_id: Uuid,
        user_id: Uuid,
        action: ApprovalAction,
        options: ActOptions,
    ) -> ApprovalResult<ActOutcome> {
        let mut tx = self.db_pool.begin().await?;
        let outcome = self.act_in(&mut tx, instance_id, user_id, action, &options).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn act_in(
        &self,
        conn: &mut PgConnection,
        instance_id: Uuid,
        user_id: Uuid,
        action: ApprovalAction,
        options: &ActOptions,
    ) -> ApprovalResult<ActOutcome> {
        let instance = guard::lock_instance(&mut *conn, instance_id).await?;

        if instance.status.is_terminal() {
            return Err(ApprovalError::AlreadyClosed {
                status: instance.status,
            });
        }

        if instance.flow_type == "expense"
            && action == ApprovalAction::Approve
            && instance.status == ApprovalStatus::PendingQa
        {
            self.ensure_qa_checklist_complete(&mut *conn, instance.target_id).await?;
        }

        let current = instance.current_step.ok_or(ApprovalError::MissingCurrentStep)?;

        let mut steps = store::load_steps(&mut *conn, instance.id).await?;
        let groups = options.groups();

        let step = {
            let stage = stage_steps(&steps, current);
            select_step(&stage, user_id, &groups)?.clone()
        };

        let vote = action.step_status();
        store::record_vote(&mut *conn, step.id, vote, user_id, options.reason.as_deref()).await?;

        debug!(
            "User {} {} step {} of approval {} (stage {})",
            user_id,
            action.as_str(),
            step.id,
            instance.id,
            current
        );

        let step_action = match action {
            ApprovalAction::Approve => AuditAction::StepApprove,
            ApprovalAction::Reject => AuditAction::StepReject,
        };
        let entry = AuditEntry::new(step_action, STEP_RESOURCE)
            .user(Some(user_id))
            .resource(step.id)
            .status_change(&step.status, &vote)?
            .metadata_json(json!({
                "instance_id": instance.id,
                "step_order": step.step_order,
                "reason": options.reason,
            }));
        self.write_audit_with(&mut *conn, entry, options).await;

        if let Some(voted) = steps.iter_mut().find(|s| s.id == step.id) {
            voted.status = vote;
            voted.acted_by = Some(user_id);
            voted.acted_at = Some(Utc::now());
        }

        let stage_policy = instance.stage_policy.for_stage(current);
        if let StagePolicy::Quorum(n) = stage_policy {
            let stage_size = stage_steps(&steps, current).len();
            if effective_quorum(n, stage_size) < n as usize {
                warn!(
                    "Approval {} stage {} requires {} approvals but has {} steps; capping at {}",
                    instance.id, current, n, stage_size, stage_size
                );
            }
        }

        let plan = plan_transition(&steps, current, action, stage_policy);

        let cancelled = store::cancel_steps(&mut *conn, &plan.cancel_step_ids).await?;
        for step_id in &cancelled {
            let previous = steps
                .iter()
                .find(|s| s.id == *step_id)
                .map(|s| s.status)
                .unwrap_or(StepStatus::pending_for(instance.status));

            let entry = AuditEntry::new(AuditAction::StepAutoCancel, STEP_RESOURCE)
                .user(self.config.system_actor)
                .resource(*step_id)
                .status_change(&previous, &StepStatus::Cancelled)?
                .metadata_json(json!({
                    "instance_id": instance.id,
                    "step_order": current,
                    "stage_policy": stage_policy.to_string(),
                    "triggered_by": user_id,
                }));
            self.write_audit_with(&mut *conn, entry, options).await;
        }

        let updated = store::update_instance(&mut *conn, instance.id, plan.status, plan.current_step).await?;

        if updated.status != instance.status || updated.current_step != instance.current_step {
            let mut entry = AuditEntry::new(AuditAction::InstanceTransition, INSTANCE_RESOURCE)
                .user(Some(user_id))
                .resource(instance.id)
                .status_change(&instance.status, &updated.status)?
                .metadata_json(json!({
                    "from_step": instance.current_step,
                    "to_step": updated.current_step,
                    "action": action.as_str(),
                }));
            if updated.status == ApprovalStatus::Rejected {
                entry = entry.warning();
            }
            self.write_audit_with(&mut *conn, entry, options).await;
        }

        if let Some(outcome) = ApprovalOutcome::from_status(updated.status) {
            self.synchronizer
                .apply(&mut *conn, &instance.target_table, instance.target_id, outcome, Some(user_id))
                .await?;

            let entry = AuditEntry::new(AuditAction::DocumentStatusSync, instance.target_table.clone())
                .user(Some(user_id))
                .resource(instance.target_id)
                .metadata_json(json!({
                    "instance_id": instance.id,
                    "outcome": outcome.as_str(),
                }));
            self.write_audit_with(&mut *conn, entry, options).await;

            info!(
                "Approval {} {} ({} {})",
                instance.id,
                outcome.as_str(),
                instance.target_table,
                instance.target_id
            );
        }

        Ok(ActOutcome {
            status: updated.status,
            current_step: updated.current_step,
        })
    }

    async fn ensure_qa_checklist_complete(&self, conn: &mut PgConnection, expense_id: Uuid) -> ApprovalResult<()> {
        let checklist = self
            .qa_checklists
            .load(conn, expense_id)
            .await
            .map_err(|e| ApprovalError::collaborator("qa_checklist", e))?;

        match checklist {
            Some(checklist) if self.qa_checklists.is_complete(&checklist) => Ok(()),
            _ => Err(ApprovalError::ExpenseQaChecklistIncomplete),
        }
    }

    /// Instance with its steps.
    pub async fn get_instance(&self, instance_id: Uuid) -> ApprovalResult<ApprovalInstanceWithSteps> {
        let mut conn = self.db_pool.acquire().await?;
        let instance = store::fetch_instance(&mut conn, instance_id)
            .await?
            .ok_or(ApprovalError::NotFound(instance_id))?;
        let steps = store::load_steps(&mut conn, instance_id).await?;

        Ok(ApprovalInstanceWithSteps { instance, steps })
    }

    /// Open instances awaiting an action from `user_id`.
    pub async fn pending_for(&self, user_id: Uuid, groups: &HashSet<Uuid>) -> ApprovalResult<Vec<ApprovalInstance>> {
        let group_ids: Vec<Uuid> = groups.iter().copied().collect();
        let mut conn = self.db_pool.acquire().await?;
        Ok(store::list_actionable(&mut conn, user_id, &group_ids).await?)
    }

    async fn write_audit_with(&self, conn: &mut PgConnection, entry: AuditEntry, options: &ActOptions) {
        let entry = match &options.audit_context {
            Some(context) => entry.context(context),
            None => entry,
        };
        self.write_audit(conn, entry).await;
    }

    /// Write an audit entry under a savepoint. A failed write is rolled back to the
    /// savepoint and logged; the surrounding transaction carries on.
    async fn write_audit(&self, conn: &mut PgConnection, entry: AuditEntry) {
        let action = entry.action;
        if let Err(e) = self.audit_in_savepoint(conn, entry).await {
            warn!("Failed to write audit entry {}: {}", action.as_str(), e);
        }
    }

    async fn audit_in_savepoint(&self, conn: &mut PgConnection, entry: AuditEntry) -> AuditResult<()> {
        let mut savepoint = conn.begin().await?;
        match self.audit.log(&mut *savepoint, entry).await {
            Ok(()) => {
                savepoint.commit().await?;
                Ok(())
            }
            Err(e) => {
                savepoint.rollback().await?;
                Err(e)
            }
        }
    }
}

/// A serialization failure or deadlock aborts the creating transaction; for the caller it is
/// a lost creation race.
fn lost_race(err: ApprovalError, target: &str) -> ApprovalError {
    match err {
        ApprovalError::Database(e) if database::is_serialization_failure(&e) => {
            debug!("Approval creation for {} aborted by a concurrent transaction: {}", target, e);
            ApprovalError::CreationConflict
        }
        other => other,
    }
}
