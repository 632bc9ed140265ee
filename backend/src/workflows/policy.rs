// Stage policy - pure decisions about stage completion and stage ordering

use std::collections::BTreeSet;

use erp_shared::{ApprovalStatus, ApprovalStep, RoleClass, StagePolicy, StepStatus};

/// Anything that belongs to a stage: persisted steps and not-yet-inserted templates.
pub trait Staged {
    fn step_order(&self) -> i32;
    fn role_class(&self) -> RoleClass;
}

impl Staged for ApprovalStep {
    fn step_order(&self) -> i32 {
        self.step_order
    }

    fn role_class(&self) -> RoleClass {
        self.role_class
    }
}

/// Whether a stage whose steps currently hold `statuses` is complete under `policy`.
///
/// Cancelled steps neither count as approvals nor keep a stage open. A quorum larger
/// than the stage is capped at the stage size.
pub fn is_stage_completed(statuses: &[StepStatus], policy: StagePolicy) -> bool {
    let approved = statuses.iter().filter(|s| **s == StepStatus::Approved).count();

    match policy {
        StagePolicy::All => !statuses.iter().any(StepStatus::is_pending),
        StagePolicy::Any => approved >= 1,
        StagePolicy::Quorum(n) => approved >= effective_quorum(n, statuses.len()),
    }
}

/// Approvals a quorum stage of `stage_size` steps actually needs.
pub fn effective_quorum(quorum: u32, stage_size: usize) -> usize {
    (quorum as usize).min(stage_size)
}

/// Distinct stage orders, ascending.
pub fn stage_orders<T: Staged>(steps: &[T]) -> BTreeSet<i32> {
    steps.iter().map(Staged::step_order).collect()
}

pub fn first_stage<T: Staged>(steps: &[T]) -> Option<i32> {
    steps.iter().map(Staged::step_order).min()
}

/// The lowest stage order strictly after `current`.
pub fn next_stage<T: Staged>(steps: &[T], current: i32) -> Option<i32> {
    steps
        .iter()
        .map(Staged::step_order)
        .filter(|order| *order > current)
        .min()
}

/// A stage is a QA stage when any of its steps is a QA sign-off.
pub fn is_qa_stage<T: Staged>(steps: &[T], step_order: i32) -> bool {
    steps
        .iter()
        .any(|s| s.step_order() == step_order && s.role_class() == RoleClass::Qa)
}

/// Pending label of an instance whose active stage is `current`.
pub fn pending_status<T: Staged>(steps: &[T], current: i32) -> ApprovalStatus {
    if is_qa_stage(steps, current) {
        ApprovalStatus::PendingQa
    } else {
        ApprovalStatus::PendingExec
    }
}

/// True when some QA stage comes strictly before some executive stage.
pub fn has_qa_before_exec<T: Staged>(steps: &[T]) -> bool {
    let orders = stage_orders(steps);
    let first_qa = orders.iter().copied().find(|o| is_qa_stage(steps, *o));
    let last_exec = orders.iter().copied().rev().find(|o| !is_qa_stage(steps, *o));

    matches!((first_qa, last_exec), (Some(qa), Some(exec)) if qa < exec)
}
