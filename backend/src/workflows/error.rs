use erp_shared::ApprovalStatus;
use uuid::Uuid;

/// Failures of the approval engine. Each condition has its own variant so callers can
/// tell an ineligible approver from a lost race or a closed instance.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("Approval instance {0} not found")]
    NotFound(Uuid),
    #[error("Approval instance is already {status}")]
    AlreadyClosed { status: ApprovalStatus },
    #[error("Approval instance has no current step")]
    MissingCurrentStep,
    #[error("No actionable step for user in the current stage")]
    NoActionableStep,
    #[error("User has already acted on this stage")]
    AlreadyActed,
    #[error("Step already processed")]
    StepAlreadyProcessed,
    #[error("Expense approvals require a QA stage before executive approval")]
    ExpenseQaStageRequired,
    #[error("Expense QA checklist is incomplete")]
    ExpenseQaChecklistIncomplete,
    #[error("Invalid approval rule: {0}")]
    InvalidRule(String),
    #[error("No document handler registered for table '{0}'")]
    UnknownTargetTable(String),
    #[error("{table} {id} not found")]
    TargetNotFound { table: String, id: Uuid },
    #[error("Concurrent approval creation for the same document; retry")]
    CreationConflict,
    #[error("{service} failed: {message}")]
    Collaborator { service: &'static str, message: String },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ApprovalResult<T> = Result<T, ApprovalError>;

impl ApprovalError {
    pub fn collaborator(service: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Collaborator {
            service,
            message: err.to_string(),
        }
    }

    /// Conditions a caller may resolve by re-reading state and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StepAlreadyProcessed | Self::CreationConflict)
    }

    /// Conditions that indicate a fault rather than a rejected request.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::MissingCurrentStep | Self::Database(_) | Self::Serialization(_) | Self::Collaborator { .. }
        )
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "APPROVAL_NOT_FOUND",
            Self::AlreadyClosed { .. } => "APPROVAL_CLOSED",
            Self::MissingCurrentStep => "APPROVAL_INVARIANT_VIOLATION",
            Self::NoActionableStep => "NO_ACTIONABLE_STEP",
            Self::AlreadyActed => "ALREADY_ACTED",
            Self::StepAlreadyProcessed => "STEP_ALREADY_PROCESSED",
            Self::ExpenseQaStageRequired => "EXPENSE_QA_STAGE_REQUIRED",
            Self::ExpenseQaChecklistIncomplete => "EXPENSE_QA_CHECKLIST_INCOMPLETE",
            Self::InvalidRule(_) => "INVALID_APPROVAL_RULE",
            Self::UnknownTargetTable(_) => "UNKNOWN_TARGET_TABLE",
            Self::TargetNotFound { .. } => "TARGET_NOT_FOUND",
            Self::CreationConflict => "APPROVAL_CREATION_CONFLICT",
            Self::Collaborator { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}
