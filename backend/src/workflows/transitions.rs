// Approval state machine - step selection and outcome planning
//
// Everything here is pure: the engine loads the locked instance and its steps,
// asks this module what to do, and persists the answer.

use std::collections::HashSet;

use erp_shared::{ApprovalAction, ApprovalStatus, ApprovalStep, StagePolicy};
use uuid::Uuid;

use super::error::{ApprovalError, ApprovalResult};
use super::policy;

/// Why a user may act on a step. Ordered by preference when several steps qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Eligibility {
    User,
    Group,
    Open,
}

pub fn eligibility(step: &ApprovalStep, user_id: Uuid, groups: &HashSet<Uuid>) -> Option<Eligibility> {
    if step.approver_user_id == Some(user_id) {
        return Some(Eligibility::User);
    }
    if let Some(group_id) = step.approver_group_id {
        if groups.contains(&group_id) {
            return Some(Eligibility::Group);
        }
    }
    if step.approver_user_id.is_none() && step.approver_group_id.is_none() {
        // Unrestricted; stage-level permission is checked upstream
        return Some(Eligibility::Open);
    }
    None
}

/// Steps of the active stage, in stored order.
pub fn stage_steps(steps: &[ApprovalStep], step_order: i32) -> Vec<&ApprovalStep> {
    steps.iter().filter(|s| s.step_order == step_order).collect()
}

/// Pick the single step `user_id` acts on within `stage`.
///
/// A user holding a vote anywhere in the stage may not vote again through a sibling step.
pub fn select_step<'s>(
    stage: &[&'s ApprovalStep],
    user_id: Uuid,
    groups: &HashSet<Uuid>,
) -> ApprovalResult<&'s ApprovalStep> {
    if stage
        .iter()
        .any(|s| s.acted_by == Some(user_id) && s.status.is_vote())
    {
        return Err(ApprovalError::AlreadyActed);
    }

    stage
        .iter()
        .filter(|s| s.status.is_pending())
        .filter_map(|s| eligibility(s, user_id, groups).map(|e| (e, *s)))
        .min_by_key(|(e, _)| *e)
        .map(|(_, step)| step)
        .ok_or(ApprovalError::NoActionableStep)
}

/// What the engine must persist after a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub status: ApprovalStatus,
    pub current_step: Option<i32>,
    /// Pending siblings closed because the stage resolved early
    pub cancel_step_ids: Vec<Uuid>,
    pub stage_completed: bool,
}

/// Decide the instance transition. `steps` must already carry the vote just cast on
/// the `current` stage.
pub fn plan_transition(
    steps: &[ApprovalStep],
    current: i32,
    action: ApprovalAction,
    stage_policy: StagePolicy,
) -> TransitionPlan {
    if action == ApprovalAction::Reject {
        // Remaining steps stay as they are; the instance is closed
        return TransitionPlan {
            status: ApprovalStatus::Rejected,
            current_step: None,
            cancel_step_ids: Vec::new(),
            stage_completed: true,
        };
    }

    let stage = stage_steps(steps, current);
    let statuses: Vec<_> = stage.iter().map(|s| s.status).collect();

    if !policy::is_stage_completed(&statuses, stage_policy) {
        return TransitionPlan {
            status: policy::pending_status(steps, current),
            current_step: Some(current),
            cancel_step_ids: Vec::new(),
            stage_completed: false,
        };
    }

    let cancel_step_ids = match stage_policy {
        StagePolicy::Any | StagePolicy::Quorum(_) => stage
            .iter()
            .filter(|s| s.status.is_pending())
            .map(|s| s.id)
            .collect(),
        StagePolicy::All => Vec::new(),
    };

    match policy::next_stage(steps, current) {
        Some(next) => TransitionPlan {
            status: policy::pending_status(steps, next),
            current_step: Some(next),
            cancel_step_ids,
            stage_completed: true,
        },
        None => TransitionPlan {
            status: ApprovalStatus::Approved,
            current_step: None,
            cancel_step_ids,
            stage_completed: true,
        },
    }
}
