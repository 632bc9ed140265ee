use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Rule id recorded on instances built from a default or hand-assembled template.
pub const MANUAL_RULE_ID: Uuid = Uuid::nil();

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "approval_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    PendingQa,
    PendingExec,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingQa => "pending_qa",
            Self::PendingExec => "pending_exec",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::PendingQa | Self::PendingExec)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "approval_step_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    PendingQa,
    PendingExec,
    Approved,
    Rejected,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingQa => "pending_qa",
            Self::PendingExec => "pending_exec",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingQa | Self::PendingExec)
    }

    /// A human vote; system cancellations are not votes.
    pub fn is_vote(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    /// The pending step status matching an instance's pending label.
    pub fn pending_for(label: ApprovalStatus) -> Self {
        match label {
            ApprovalStatus::PendingQa => Self::PendingQa,
            _ => Self::PendingExec,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kind of sign-off a step represents.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "approval_role_class", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoleClass {
    Qa,
    #[default]
    Exec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    pub fn step_status(&self) -> StepStatus {
        match self {
            Self::Approve => StepStatus::Approved,
            Self::Reject => StepStatus::Rejected,
        }
    }
}

/// Terminal result propagated back to the source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
}

impl ApprovalOutcome {
    pub fn from_status(status: ApprovalStatus) -> Option<Self> {
        match status {
            ApprovalStatus::Approved => Some(Self::Approved),
            ApprovalStatus::Rejected => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

/// Completion policy of one stage.
///
/// Persisted either as `"all"`, `"any"`, `"quorum:N"` or as `{"mode": ..., "quorum": N}`.
/// Anything that does not describe a usable policy deserializes to [`StagePolicy::All`],
/// the strictest mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StagePolicy {
    #[default]
    All,
    Any,
    Quorum(u32),
}

#[derive(Serialize, Deserialize)]
struct StagePolicyRepr {
    mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quorum: Option<serde_json::Value>,
}

impl StagePolicy {
    /// Strict parse of a persisted policy value. `Err` carries a description of why the
    /// value is unusable; callers fall back to [`StagePolicy::All`].
    pub fn parse(value: &serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::String(text) => Self::parse_text(text),
            serde_json::Value::Object(_) => {
                let repr: StagePolicyRepr = serde_json::from_value(value.clone())
                    .map_err(|e| format!("malformed stage policy: {}", e))?;
                match repr.mode.trim().to_ascii_lowercase().as_str() {
                    "all" => Ok(Self::All),
                    "any" => Ok(Self::Any),
                    "quorum" => match repr.quorum {
                        Some(serde_json::Value::Number(n)) => n
                            .as_u64()
                            .and_then(|n| u32::try_from(n).ok())
                            .filter(|n| *n > 0)
                            .map(Self::Quorum)
                            .ok_or_else(|| format!("invalid quorum {}", n)),
                        Some(serde_json::Value::String(s)) => Self::parse_quorum(&s),
                        Some(other) => Err(format!("invalid quorum {}", other)),
                        None => Err("quorum policy without quorum".to_string()),
                    },
                    other => Err(format!("unknown stage policy mode '{}'", other)),
                }
            }
            other => Err(format!("unsupported stage policy value {}", other)),
        }
    }

    fn parse_text(text: &str) -> Result<Self, String> {
        let text = text.trim().to_ascii_lowercase();
        match text.as_str() {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            _ => match text.strip_prefix("quorum") {
                Some(rest) => Self::parse_quorum(rest.trim_start_matches(':')),
                None => Err(format!("unknown stage policy '{}'", text)),
            },
        }
    }

    fn parse_quorum(n: &str) -> Result<Self, String> {
        match n.trim().parse::<u32>() {
            Ok(n) if n > 0 => Ok(Self::Quorum(n)),
            _ => Err(format!("invalid quorum '{}'", n)),
        }
    }
}

impl fmt::Display for StagePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Any => f.write_str("any"),
            Self::Quorum(n) => write!(f, "quorum:{}", n),
        }
    }
}

impl Serialize for StagePolicy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            Self::All => StagePolicyRepr { mode: "all".to_string(), quorum: None },
            Self::Any => StagePolicyRepr { mode: "any".to_string(), quorum: None },
            Self::Quorum(n) => StagePolicyRepr {
                mode: "quorum".to_string(),
                quorum: Some(serde_json::json!(n)),
            },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StagePolicy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::parse(&value).unwrap_or_default())
    }
}

/// Stage order -> completion policy. Stages without an entry use [`StagePolicy::All`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagePolicies(pub BTreeMap<i32, StagePolicy>);

impl StagePolicies {
    pub fn for_stage(&self, step_order: i32) -> StagePolicy {
        self.0.get(&step_order).copied().unwrap_or_default()
    }

    pub fn set(&mut self, step_order: i32, policy: StagePolicy) {
        self.0.insert(step_order, policy);
    }
}

#[cfg(feature = "sqlx")]
mod pg_json {
    use super::StagePolicies;
    use sqlx::encode::IsNull;
    use sqlx::error::BoxDynError;
    use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
    use sqlx::types::Json;
    use sqlx::{Decode, Encode, Postgres, Type};

    impl Type<Postgres> for StagePolicies {
        fn type_info() -> PgTypeInfo {
            <Json<StagePolicies> as Type<Postgres>>::type_info()
        }

        fn compatible(ty: &PgTypeInfo) -> bool {
            <Json<StagePolicies> as Type<Postgres>>::compatible(ty)
        }
    }

    impl<'r> Decode<'r, Postgres> for StagePolicies {
        fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
            let Json(policies) = <Json<StagePolicies> as Decode<'r, Postgres>>::decode(value)?;
            Ok(policies)
        }
    }

    impl Encode<'_, Postgres> for StagePolicies {
        fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
            <Json<&StagePolicies> as Encode<'_, Postgres>>::encode_by_ref(&Json(self), buf)
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: Uuid,
    pub flow_type: String,
    pub target_table: String,
    pub target_id: Uuid,
    pub project_id: Option<Uuid>,
    pub status: ApprovalStatus,
    pub current_step: Option<i32>,
    pub stage_policy: StagePolicies,
    pub rule_id: Uuid,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub step_order: i32,
    pub approver_group_id: Option<Uuid>,
    pub approver_user_id: Option<Uuid>,
    pub role_class: RoleClass,
    pub status: StepStatus,
    pub acted_by: Option<Uuid>,
    pub acted_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalInstanceWithSteps {
    #[serde(flatten)]
    pub instance: ApprovalInstance,
    pub steps: Vec<ApprovalStep>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: Uuid,
    pub flow_type: String,
    pub name: String,
    pub is_active: bool,
    pub effective_from: DateTime<Utc>,
    pub conditions: Option<serde_json::Value>,
    pub steps: serde_json::Value,
    pub stage_policy: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// One approver slot in a rule or default template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    #[serde(default)]
    pub step_order: Option<i32>,
    #[serde(default)]
    pub approver_group_id: Option<Uuid>,
    #[serde(default)]
    pub approver_user_id: Option<Uuid>,
    #[serde(default)]
    pub role_class: RoleClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl StepTemplate {
    pub fn user(step_order: i32, user_id: Uuid) -> Self {
        Self {
            step_order: Some(step_order),
            approver_user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn group(step_order: i32, group_id: Uuid) -> Self {
        Self {
            step_order: Some(step_order),
            approver_group_id: Some(group_id),
            ..Default::default()
        }
    }

    pub fn open(step_order: i32) -> Self {
        Self {
            step_order: Some(step_order),
            ..Default::default()
        }
    }

    pub fn qa(mut self) -> Self {
        self.role_class = RoleClass::Qa;
        self
    }
}

/// Result of an approver action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActOutcome {
    pub status: ApprovalStatus,
    pub current_step: Option<i32>,
}
