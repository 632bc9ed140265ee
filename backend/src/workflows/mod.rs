// Approval Workflow Engine
//
// Multi-stage approvals for ERP documents: rule resolution, stage policies,
// approver actions and write-back of the outcome to the governed document.

pub mod conditions;
pub mod engine;
pub mod error;
pub mod guard;
pub mod policy;
pub mod rules;
pub mod store;
pub mod sync;
pub mod transitions;

pub use engine::{ActOptions, CreateOptions, SubmitOutcome, SubmitRequest, WorkflowEngine};
pub use error::ApprovalError;
