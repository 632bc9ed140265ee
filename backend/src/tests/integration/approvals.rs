// Engine behaviour against a real PostgreSQL database.
//
// Run with `cargo test -- --ignored` (needs Docker or TEST_DATABASE_URL).

use async_trait::async_trait;
use erp_shared::{ApprovalAction, ApprovalStatus, StagePolicy, StepStatus, StepTemplate};
use futures::future::join_all;
use serde_json::json;
use serial_test::serial;
use sqlx::PgConnection;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ApprovalConfig;
use crate::services::audit::{AuditEntry, AuditLogger, AuditResult, AuditService};
use crate::services::evidence::{EvidenceError, EvidenceOutcome, EvidenceRequest, EvidenceSnapshotService};
use crate::tests::{fixtures::*, helpers::*, TestContext};
use crate::workflows::{store, ActOptions, ApprovalError, CreateOptions, SubmitRequest, WorkflowEngine};

fn engine(ctx: &TestContext) -> WorkflowEngine {
    WorkflowEngine::new(ctx.db_pool.clone(), ApprovalConfig::default())
}

async fn estimate(ctx: &TestContext) -> DocumentFixture {
    let doc = DocumentFixture::new(None);
    insert_estimate_fixture(&ctx.db_pool, &doc).await.unwrap();
    doc
}

async fn open_estimate_approval(engine: &WorkflowEngine, doc: &DocumentFixture) -> erp_shared::ApprovalInstance {
    engine
        .create_approval_for("estimate", "estimates", doc.id, &doc.payload(), CreateOptions::default())
        .await
        .unwrap()
}

fn in_groups(groups: &[Uuid]) -> ActOptions {
    ActOptions {
        actor_group_ids: groups.to_vec(),
        ..Default::default()
    }
}

struct FailingEvidence;

#[async_trait]
impl EvidenceSnapshotService for FailingEvidence {
    async fn create_for_approval(
        &self,
        _conn: &mut PgConnection,
        request: EvidenceRequest,
    ) -> Result<EvidenceOutcome, EvidenceError> {
        Err(EvidenceError::TargetMissing {
            table: request.target_table,
            id: request.target_id,
        })
    }
}

/// Fails with a real database error, which aborts the transaction unless contained
struct BrokenAudit;

#[async_trait]
impl AuditLogger for BrokenAudit {
    async fn log(&self, conn: &mut PgConnection, _entry: AuditEntry) -> AuditResult<()> {
        sqlx::query("INSERT INTO audit_logs_missing (id) VALUES (1)")
            .execute(conn)
            .await?;
        Ok(())
    }
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_estimate_two_stage_scenario() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);
    let (manager, director) = (Uuid::new_v4(), Uuid::new_v4());

    let rule = RuleFixture::new(
        "estimate",
        vec![StepTemplate::user(1, manager), StepTemplate::user(2, director)],
    );
    insert_rule_fixture(&ctx.db_pool, &rule).await.unwrap();
    let doc = estimate(&ctx).await;

    let instance = open_estimate_approval(&engine, &doc).await;
    assert_eq!(instance.status, ApprovalStatus::PendingExec);
    assert_eq!(instance.current_step, Some(1));
    assert_eq!(instance.rule_id, rule.id);

    let early = engine
        .act(instance.id, director, ApprovalAction::Approve, ActOptions::default())
        .await;
    assert!(matches!(early, Err(ApprovalError::NoActionableStep)));

    let first = engine
        .act(instance.id, manager, ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, ApprovalStatus::PendingExec);
    assert_eq!(first.current_step, Some(2));
    assert_eq!(document_status(&ctx.db_pool, "estimates", "status", doc.id).await, "draft");

    let second = engine
        .act(instance.id, director, ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(second.status, ApprovalStatus::Approved);
    assert_eq!(second.current_step, None);
    assert_eq!(document_status(&ctx.db_pool, "estimates", "status", doc.id).await, "approved");

    // create + two votes + two instance transitions
    let history = AuditService::new(ctx.db_pool.clone())
        .get_approval_history(instance.id)
        .await
        .unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].action, "approval_create");

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_concurrent_create_yields_one_open_instance() {
    let ctx = TestContext::new().await;
    let engine = Arc::new(engine(&ctx));
    let doc = estimate(&ctx).await;

    let tasks = (0..8).map(|_| {
        let engine = engine.clone();
        let doc = doc.clone();
        tokio::spawn(async move {
            engine
                .create_approval_for("estimate", "estimates", doc.id, &doc.payload(), CreateOptions::default())
                .await
        })
    });

    let ids: Vec<Uuid> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().id)
        .collect();

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(open_instance_count(&ctx.db_pool, doc.id).await, 1);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_concurrent_votes_are_not_lost() {
    let ctx = TestContext::new().await;
    let engine = Arc::new(engine(&ctx));
    let group = Uuid::new_v4();

    let rule = RuleFixture::new(
        "estimate",
        vec![StepTemplate::group(1, group), StepTemplate::group(1, group), StepTemplate::group(1, group)],
    );
    insert_rule_fixture(&ctx.db_pool, &rule).await.unwrap();
    let doc = estimate(&ctx).await;
    let instance = open_estimate_approval(&engine, &doc).await;

    let voters: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let tasks = voters.iter().map(|voter| {
        let engine = engine.clone();
        let voter = *voter;
        tokio::spawn(async move {
            engine
                .act(instance.id, voter, ApprovalAction::Approve, in_groups(&[group]))
                .await
        })
    });

    for joined in join_all(tasks).await {
        joined.unwrap().unwrap();
    }

    let approval = engine.get_instance(instance.id).await.unwrap();
    assert_eq!(approval.instance.status, ApprovalStatus::Approved);
    assert!(approval.steps.iter().all(|s| s.status == StepStatus::Approved));

    let mut acted: Vec<Uuid> = approval.steps.iter().filter_map(|s| s.acted_by).collect();
    acted.sort();
    let mut expected = voters.clone();
    expected.sort();
    assert_eq!(acted, expected);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_quorum_cancels_remaining_steps() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);
    let controller = Uuid::new_v4();

    let rule = RuleFixture::new(
        "estimate",
        vec![
            StepTemplate::open(1),
            StepTemplate::open(1),
            StepTemplate::open(1),
            StepTemplate::user(2, controller),
        ],
    )
    .with_stage_policy(1, StagePolicy::Quorum(2));
    insert_rule_fixture(&ctx.db_pool, &rule).await.unwrap();
    let doc = estimate(&ctx).await;
    let instance = open_estimate_approval(&engine, &doc).await;

    let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let outcome = engine
        .act(instance.id, u1, ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.current_step, Some(1));

    let outcome = engine
        .act(instance.id, u2, ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.current_step, Some(2));
    assert_eq!(outcome.status, ApprovalStatus::PendingExec);

    let approval = engine.get_instance(instance.id).await.unwrap();
    let stage_one: Vec<StepStatus> = approval
        .steps
        .iter()
        .filter(|s| s.step_order == 1)
        .map(|s| s.status)
        .collect();
    assert_eq!(stage_one.iter().filter(|s| **s == StepStatus::Approved).count(), 2);
    assert_eq!(stage_one.iter().filter(|s| **s == StepStatus::Cancelled).count(), 1);

    let late = engine
        .act(instance.id, u3, ApprovalAction::Approve, ActOptions::default())
        .await;
    assert!(matches!(late, Err(ApprovalError::NoActionableStep)));

    let cancellations: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM audit_logs WHERE action = 'approval_step_auto_cancel'")
            .fetch_one(&ctx.db_pool)
            .await
            .unwrap();
    assert_eq!(cancellations, 1);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_any_policy_short_circuits_stage() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);
    let (sales, finance) = (Uuid::new_v4(), Uuid::new_v4());

    let rule = RuleFixture::new(
        "estimate",
        vec![StepTemplate::group(1, sales), StepTemplate::group(1, finance)],
    )
    .with_stage_policy(1, StagePolicy::Any);
    insert_rule_fixture(&ctx.db_pool, &rule).await.unwrap();
    let doc = estimate(&ctx).await;
    let instance = open_estimate_approval(&engine, &doc).await;

    let outcome = engine
        .act(instance.id, Uuid::new_v4(), ApprovalAction::Approve, in_groups(&[finance]))
        .await
        .unwrap();
    assert_eq!(outcome.status, ApprovalStatus::Approved);

    let approval = engine.get_instance(instance.id).await.unwrap();
    let sales_step = approval
        .steps
        .iter()
        .find(|s| s.approver_group_id == Some(sales))
        .unwrap();
    assert_eq!(sales_step.status, StepStatus::Cancelled);
    assert_eq!(document_status(&ctx.db_pool, "estimates", "status", doc.id).await, "approved");

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_same_user_cannot_fill_two_steps_of_a_stage() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);

    let rule = RuleFixture::new("estimate", vec![StepTemplate::open(1), StepTemplate::open(1)]);
    insert_rule_fixture(&ctx.db_pool, &rule).await.unwrap();
    let doc = estimate(&ctx).await;
    let instance = open_estimate_approval(&engine, &doc).await;

    let user = Uuid::new_v4();
    engine
        .act(instance.id, user, ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();

    let again = engine
        .act(instance.id, user, ApprovalAction::Approve, ActOptions::default())
        .await;
    assert!(matches!(again, Err(ApprovalError::AlreadyActed)));

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_expense_rule_without_qa_stage_is_refused() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);

    let rule = RuleFixture::new("expense", vec![StepTemplate::open(1), StepTemplate::open(2)]);
    insert_rule_fixture(&ctx.db_pool, &rule).await.unwrap();
    let expense = DocumentFixture::new(None);
    insert_expense_fixture(&ctx.db_pool, &expense).await.unwrap();

    let result = engine
        .create_approval_for("expense", "expenses", expense.id, &expense.payload(), CreateOptions::default())
        .await;
    assert!(matches!(result, Err(ApprovalError::ExpenseQaStageRequired)));
    assert_eq!(count_table_rows(&ctx.db_pool, "approval_instances").await, 0);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_expense_qa_checklist_gates_approval() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);
    let expense = DocumentFixture::new(None);
    insert_expense_fixture(&ctx.db_pool, &expense).await.unwrap();

    // No rule: the built-in expense template (QA stage, then executive stage)
    let instance = engine
        .create_approval_for("expense", "expenses", expense.id, &expense.payload(), CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(instance.status, ApprovalStatus::PendingQa);

    let reviewer = Uuid::new_v4();
    let blocked = engine
        .act(instance.id, reviewer, ApprovalAction::Approve, ActOptions::default())
        .await;
    assert!(matches!(blocked, Err(ApprovalError::ExpenseQaChecklistIncomplete)));

    insert_qa_checklist_fixture(&ctx.db_pool, expense.id, json!({"receipt": true, "coding": false}))
        .await
        .unwrap();
    let blocked = engine
        .act(instance.id, reviewer, ApprovalAction::Approve, ActOptions::default())
        .await;
    assert!(matches!(blocked, Err(ApprovalError::ExpenseQaChecklistIncomplete)));

    insert_qa_checklist_fixture(&ctx.db_pool, expense.id, json!({"receipt": true, "coding": true}))
        .await
        .unwrap();
    let outcome = engine
        .act(instance.id, reviewer, ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, ApprovalStatus::PendingExec);
    assert_eq!(outcome.current_step, Some(2));

    let outcome = engine
        .act(instance.id, Uuid::new_v4(), ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, ApprovalStatus::Approved);
    assert_eq!(document_status(&ctx.db_pool, "expenses", "status", expense.id).await, "approved");

    let (from_status, to_status, settlement): (Option<String>, String, Option<String>) = sqlx::query_as(
        "SELECT from_status, to_status, to_settlement_status FROM expense_state_transitions WHERE expense_id = $1",
    )
    .bind(expense.id)
    .fetch_one(&ctx.db_pool)
    .await
    .unwrap();
    assert_eq!(from_status.as_deref(), Some("submitted"));
    assert_eq!(to_status, "approved");
    assert_eq!(settlement.as_deref(), Some("unsettled"));

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_submit_rolls_back_when_evidence_capture_fails() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx).with_evidence_service(Arc::new(FailingEvidence));
    let doc = estimate(&ctx).await;

    let mutator = engine.synchronizer().mutator("estimates").unwrap().clone();
    let target_id = doc.id;
    let result = engine
        .submit_approval_with_update(
            SubmitRequest {
                flow_type: "estimate".to_string(),
                target_table: "estimates".to_string(),
                target_id,
                payload: None,
                created_by: None,
            },
            move |conn| Box::pin(async move { mutator.mark_submitted(conn, target_id).await }),
        )
        .await;

    assert!(matches!(
        result,
        Err(ApprovalError::Collaborator { service: "evidence_snapshot", .. })
    ));
    assert_eq!(document_status(&ctx.db_pool, "estimates", "status", doc.id).await, "draft");
    assert_eq!(count_table_rows(&ctx.db_pool, "approval_instances").await, 0);
    assert_eq!(count_table_rows(&ctx.db_pool, "approval_steps").await, 0);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_submit_commits_document_approval_and_evidence() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);
    let doc = estimate(&ctx).await;
    let submitter = Uuid::new_v4();

    let mutator = engine.synchronizer().mutator("estimates").unwrap().clone();
    let target_id = doc.id;
    let outcome = engine
        .submit_approval_with_update(
            SubmitRequest {
                flow_type: "estimate".to_string(),
                target_table: "estimates".to_string(),
                target_id,
                payload: None,
                created_by: Some(submitter),
            },
            move |conn| Box::pin(async move { mutator.mark_submitted(conn, target_id).await }),
        )
        .await
        .unwrap();

    assert_eq!(outcome.updated["status"], "pending_approval");
    assert_eq!(outcome.approval.status, ApprovalStatus::PendingExec);
    assert_eq!(outcome.approval.created_by, Some(submitter));

    let snapshot: serde_json::Value = sqlx::query_scalar(
        "SELECT snapshot FROM approval_evidence_snapshots WHERE approval_instance_id = $1",
    )
    .bind(outcome.approval.id)
    .fetch_one(&ctx.db_pool)
    .await
    .unwrap();
    assert_eq!(snapshot["document"]["status"], "pending_approval");
    assert_eq!(snapshot["approval_steps"].as_array().map(Vec::len), Some(1));

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_rejection_is_final() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    let rule = RuleFixture::new(
        "estimate",
        vec![StepTemplate::user(1, a), StepTemplate::user(1, b), StepTemplate::user(2, c)],
    );
    insert_rule_fixture(&ctx.db_pool, &rule).await.unwrap();
    let doc = estimate(&ctx).await;
    let instance = open_estimate_approval(&engine, &doc).await;

    let options = ActOptions {
        reason: Some("Margin too low".to_string()),
        ..Default::default()
    };
    let outcome = engine
        .act(instance.id, a, ApprovalAction::Reject, options)
        .await
        .unwrap();
    assert_eq!(outcome.status, ApprovalStatus::Rejected);
    assert_eq!(outcome.current_step, None);

    let approval = engine.get_instance(instance.id).await.unwrap();
    for step in &approval.steps {
        match step.approver_user_id {
            Some(id) if id == a => {
                assert_eq!(step.status, StepStatus::Rejected);
                assert_eq!(step.reason.as_deref(), Some("Margin too low"));
            }
            _ => assert_eq!(step.status, StepStatus::PendingExec),
        }
    }

    let closed = engine
        .act(instance.id, b, ApprovalAction::Approve, ActOptions::default())
        .await;
    assert!(matches!(
        closed,
        Err(ApprovalError::AlreadyClosed { status: ApprovalStatus::Rejected })
    ));
    assert_eq!(document_status(&ctx.db_pool, "estimates", "status", doc.id).await, "rejected");

    // A rejected document can be resubmitted into a fresh cycle
    let next = open_estimate_approval(&engine, &doc).await;
    assert_ne!(next.id, instance.id);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_audit_failure_does_not_abort_action() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx).with_audit_logger(Arc::new(BrokenAudit));
    let doc = estimate(&ctx).await;

    let instance = open_estimate_approval(&engine, &doc).await;
    let outcome = engine
        .act(instance.id, Uuid::new_v4(), ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.status, ApprovalStatus::Approved);
    assert_eq!(document_status(&ctx.db_pool, "estimates", "status", doc.id).await, "approved");
    assert_eq!(count_table_rows(&ctx.db_pool, "audit_logs").await, 0);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_step_write_is_conditional() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);
    let doc = estimate(&ctx).await;
    let instance = open_estimate_approval(&engine, &doc).await;

    let mut conn = ctx.db_pool.acquire().await.unwrap();
    let steps = store::load_steps(&mut conn, instance.id).await.unwrap();
    let step_id = steps[0].id;

    store::record_vote(&mut conn, step_id, StepStatus::Approved, Uuid::new_v4(), None)
        .await
        .unwrap();
    let second = store::record_vote(&mut conn, step_id, StepStatus::Rejected, Uuid::new_v4(), None).await;
    assert!(matches!(second, Err(ApprovalError::StepAlreadyProcessed)));
    assert!(ApprovalError::StepAlreadyProcessed.is_retryable());

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_rule_matching_sees_project_fields() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);

    let project = ProjectFixture {
        project_type: "maintenance".to_string(),
        ..Default::default()
    };
    insert_project_fixture(&ctx.db_pool, &project).await.unwrap();

    let maintenance = RuleFixture::new("estimate", vec![StepTemplate::open(1)]).with_conditions(json!({
        "conditions": [{"field": "project_type", "operator": "equals", "value": "maintenance"}]
    }));
    insert_rule_fixture(&ctx.db_pool, &maintenance).await.unwrap();

    // Newer, so considered first
    let construction = RuleFixture::new("estimate", vec![StepTemplate::open(1)]).with_conditions(json!({
        "conditions": [{"field": "project_type", "operator": "equals", "value": "construction"}]
    }));
    insert_rule_fixture(&ctx.db_pool, &construction).await.unwrap();

    let doc = DocumentFixture::new(Some(project.id));
    insert_estimate_fixture(&ctx.db_pool, &doc).await.unwrap();

    let instance = open_estimate_approval(&engine, &doc).await;
    assert_eq!(instance.rule_id, maintenance.id);
    assert_eq!(instance.project_id, Some(project.id));

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_single_stage_all_policy_scenario() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    let rule = RuleFixture::new("estimate", vec![StepTemplate::user(1, u1), StepTemplate::user(1, u2)]);
    insert_rule_fixture(&ctx.db_pool, &rule).await.unwrap();
    let doc = estimate(&ctx).await;
    let instance = open_estimate_approval(&engine, &doc).await;
    assert_eq!(instance.status, ApprovalStatus::PendingExec);
    assert_eq!(instance.current_step, Some(1));

    let first = engine
        .act(instance.id, u1, ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(first.status, ApprovalStatus::PendingExec);
    assert_eq!(first.current_step, Some(1));
    assert_eq!(document_status(&ctx.db_pool, "estimates", "status", doc.id).await, "draft");

    let second = engine
        .act(instance.id, u2, ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(second.status, ApprovalStatus::Approved);
    assert_eq!(second.current_step, None);
    assert_eq!(document_status(&ctx.db_pool, "estimates", "status", doc.id).await, "approved");

    let approval = engine.get_instance(instance.id).await.unwrap();
    assert!(approval.steps.iter().all(|s| s.status == StepStatus::Approved));

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_quorum_above_stage_size_still_completes() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);

    let rule = RuleFixture::new(
        "estimate",
        vec![StepTemplate::open(1), StepTemplate::open(1), StepTemplate::open(1)],
    )
    .with_stage_policy(1, StagePolicy::Quorum(5));
    insert_rule_fixture(&ctx.db_pool, &rule).await.unwrap();
    let doc = estimate(&ctx).await;
    let instance = open_estimate_approval(&engine, &doc).await;

    for _ in 0..2 {
        let outcome = engine
            .act(instance.id, Uuid::new_v4(), ApprovalAction::Approve, ActOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, ApprovalStatus::PendingExec);
        assert_eq!(outcome.current_step, Some(1));
    }

    let last = engine
        .act(instance.id, Uuid::new_v4(), ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(last.status, ApprovalStatus::Approved);
    assert_eq!(last.current_step, None);
    assert_eq!(document_status(&ctx.db_pool, "estimates", "status", doc.id).await, "approved");
    assert_eq!(open_instance_count(&ctx.db_pool, doc.id).await, 0);

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_concurrent_submits_lose_with_retryable_conflict() {
    let ctx = TestContext::new().await;
    let engine = Arc::new(engine(&ctx));
    let doc = estimate(&ctx).await;

    let tasks = (0..4).map(|_| {
        let engine = engine.clone();
        let target_id = doc.id;
        tokio::spawn(async move {
            let mutator = engine.synchronizer().mutator("estimates")?.clone();
            engine
                .submit_approval_with_update(
                    SubmitRequest {
                        flow_type: "estimate".to_string(),
                        target_table: "estimates".to_string(),
                        target_id,
                        payload: None,
                        created_by: None,
                    },
                    move |conn| Box::pin(async move { mutator.mark_submitted(conn, target_id).await }),
                )
                .await
        })
    });

    let results: Vec<_> = join_all(tasks).await.into_iter().map(|joined| joined.unwrap()).collect();

    let approvals: Vec<Uuid> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .map(|outcome| outcome.approval.id)
        .collect();
    assert!(!approvals.is_empty());
    assert!(approvals.iter().all(|id| *id == approvals[0]));

    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(err, ApprovalError::CreationConflict), "unexpected error: {err}");
        assert!(err.is_retryable());
    }

    assert_eq!(open_instance_count(&ctx.db_pool, doc.id).await, 1);
    assert_eq!(
        document_status(&ctx.db_pool, "estimates", "status", doc.id).await,
        "pending_approval"
    );

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_outcomes_reach_every_document_table() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);

    let approve_one = |flow_type: &'static str, table: &'static str| {
        let engine = &engine;
        let pool = ctx.db_pool.clone();
        async move {
            let id = Uuid::new_v4();
            insert_target_row(&pool, table, id).await.unwrap();
            let instance = engine
                .create_approval_for(flow_type, table, id, &json!({}), CreateOptions::default())
                .await
                .unwrap();
            (id, instance.id)
        }
    };

    let (entry_id, entry_approval) = approve_one("time_entry", "time_entries").await;
    let outcome = engine
        .act(entry_approval, Uuid::new_v4(), ApprovalAction::Approve, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, ApprovalStatus::Approved);
    assert_eq!(
        document_status(&ctx.db_pool, "time_entries", "approval_status", entry_id).await,
        "approved"
    );

    let (leave_id, leave_approval) = approve_one("leave_request", "leave_requests").await;
    let outcome = engine
        .act(leave_approval, Uuid::new_v4(), ApprovalAction::Reject, ActOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.status, ApprovalStatus::Rejected);
    assert_eq!(document_status(&ctx.db_pool, "leave_requests", "status", leave_id).await, "rejected");

    for (flow_type, table) in [
        ("invoice", "invoices"),
        ("purchase_order", "purchase_orders"),
        ("vendor_invoice", "vendor_invoices"),
        ("vendor_quote", "vendor_quotes"),
    ] {
        let (id, approval) = approve_one(flow_type, table).await;
        engine
            .act(approval, Uuid::new_v4(), ApprovalAction::Approve, ActOptions::default())
            .await
            .unwrap();
        assert_eq!(document_status(&ctx.db_pool, table, "status", id).await, "approved", "{table}");
    }

    ctx.cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_steps_keep_template_order_within_stage() {
    let ctx = TestContext::new().await;
    let engine = engine(&ctx);
    let groups: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

    let rule = RuleFixture::new(
        "estimate",
        groups.iter().map(|g| StepTemplate::group(1, *g)).collect(),
    );
    insert_rule_fixture(&ctx.db_pool, &rule).await.unwrap();
    let doc = estimate(&ctx).await;
    let instance = open_estimate_approval(&engine, &doc).await;

    let approval = engine.get_instance(instance.id).await.unwrap();
    let stored: Vec<Option<Uuid>> = approval.steps.iter().map(|s| s.approver_group_id).collect();
    assert_eq!(stored, groups.iter().copied().map(Some).collect::<Vec<_>>());

    // A member of every group fills the first step in template order
    for expected in &groups[..2] {
        let member = Uuid::new_v4();
        engine
            .act(instance.id, member, ApprovalAction::Approve, in_groups(&groups))
            .await
            .unwrap();

        let approval = engine.get_instance(instance.id).await.unwrap();
        let filled = approval.steps.iter().find(|s| s.acted_by == Some(member)).unwrap();
        assert_eq!(filled.approver_group_id, Some(*expected));
    }

    ctx.cleanup().await;
}
