//! HTTP error type for the approvals API.
//!
//! Engine and audit errors convert into [`AppError`], which renders an [`ApiError`] body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::services::audit::AuditError;
use crate::workflows::ApprovalError;

/// Standard API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code (e.g., "VALIDATION_ERROR", "NOT_FOUND", "STEP_ALREADY_PROCESSED")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional field-level errors for validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Vec<String>>>,
    /// Whether repeating the request after re-reading state may succeed
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub retryable: bool,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: false,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    // Authentication errors
    Unauthorized(String),
    TokenExpired,

    // Resource errors
    NotFound(String),

    // Validation errors
    ValidationError { details: HashMap<String, Vec<String>> },
    BadRequest(String),

    // Approval engine errors
    Approval(ApprovalError),

    // Server errors
    InternalError(String),
    DatabaseError(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) | Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Approval(err) => approval_status_code(err),
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Approval(err) => err.error_code(),
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::Unauthorized(msg) => msg.clone(),
            Self::TokenExpired => "Authentication token has expired".to_string(),
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::ValidationError { .. } => "Validation failed".to_string(),
            Self::BadRequest(msg) => msg.clone(),
            Self::Approval(err) if err.is_internal() => {
                tracing::error!("Approval engine error: {}", err);
                "An internal error occurred".to_string()
            }
            Self::Approval(err) => err.to_string(),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
        }
    }
}

fn approval_status_code(err: &ApprovalError) -> StatusCode {
    match err {
        ApprovalError::NotFound(_) | ApprovalError::TargetNotFound { .. } => StatusCode::NOT_FOUND,
        ApprovalError::AlreadyClosed { .. }
        | ApprovalError::AlreadyActed
        | ApprovalError::StepAlreadyProcessed
        | ApprovalError::CreationConflict => StatusCode::CONFLICT,
        ApprovalError::NoActionableStep => StatusCode::FORBIDDEN,
        ApprovalError::ExpenseQaStageRequired
        | ApprovalError::ExpenseQaChecklistIncomplete
        | ApprovalError::InvalidRule(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ApprovalError::UnknownTargetTable(_) => StatusCode::BAD_REQUEST,
        ApprovalError::Collaborator { .. } => StatusCode::BAD_GATEWAY,
        ApprovalError::MissingCurrentStep
        | ApprovalError::Database(_)
        | ApprovalError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut error = ApiError::new(self.error_code(), self.message());

        // Add details for validation errors
        if let Self::ValidationError { details } = &self {
            error.details = Some(details.clone());
        }

        if let Self::Approval(err) = &self {
            error.retryable = err.is_retryable();
        }

        (status, Json(error)).into_response()
    }
}

// Implement From for common error types
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            _ => Self::DatabaseError(err.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => Self::TokenExpired,
            _ => Self::Unauthorized(format!("Invalid token: {}", err)),
        }
    }
}

impl From<AuditError> for AppError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::Database(e) => Self::from(e),
            AuditError::Serialization(e) => Self::InternalError(e.to_string()),
        }
    }
}

impl From<ApprovalError> for AppError {
    fn from(err: ApprovalError) -> Self {
        Self::Approval(err)
    }
}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper to add multiple validation errors
pub struct ValidationBuilder {
    details: HashMap<String, Vec<String>>,
}

impl ValidationBuilder {
    pub fn new() -> Self {
        Self {
            details: HashMap::new(),
        }
    }

    pub fn error(mut self, field: &str, message: &str) -> Self {
        self.details.entry(field.to_string()).or_default().push(message.to_string());
        self
    }

    /// Record `message` for `field` when `failed` holds
    pub fn check(self, failed: bool, field: &str, message: &str) -> Self {
        if failed { self.error(field, message) } else { self }
    }

    pub fn build(self) -> Option<AppError> {
        if self.details.is_empty() {
            None
        } else {
            Some(AppError::ValidationError {
                details: self.details,
            })
        }
    }
}

impl Default for ValidationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
