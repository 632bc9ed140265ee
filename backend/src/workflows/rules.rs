// Rule resolution - picks the approval rule for a document and turns its
// step templates into the steps of a new instance

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use erp_shared::{ApprovalRule, RoleClass, StagePolicies, StagePolicy, StepTemplate, MANUAL_RULE_ID};
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

use super::conditions::ConditionGroup;
use super::error::{ApprovalError, ApprovalResult};
use super::policy::Staged;

/// Decides whether a rule's conditions accept a document payload.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleConditionMatcher: Send + Sync {
    async fn matches(&self, flow_type: &str, payload: &Value, conditions: &Value) -> bool;
}

/// Evaluates conditions stored as a `ConditionGroup`. Absent conditions accept everything;
/// conditions that do not parse accept nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConditionMatcher;

#[async_trait]
impl RuleConditionMatcher for JsonConditionMatcher {
    async fn matches(&self, flow_type: &str, payload: &Value, conditions: &Value) -> bool {
        if conditions.is_null() {
            return true;
        }

        match ConditionGroup::from_json(conditions) {
            Ok(group) => group.evaluate(payload),
            Err(e) => {
                tracing::warn!("Unparseable {} rule conditions: {}", flow_type, e);
                false
            }
        }
    }
}

/// A step ready to be inserted, with its stage order settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStep {
    pub step_order: i32,
    pub approver_group_id: Option<Uuid>,
    pub approver_user_id: Option<Uuid>,
    pub role_class: RoleClass,
}

impl Staged for NewStep {
    fn step_order(&self) -> i32 {
        self.step_order
    }

    fn role_class(&self) -> RoleClass {
        self.role_class
    }
}

/// Steps and stage policies to build an instance from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRule {
    /// `MANUAL_RULE_ID` when built from a default template
    pub rule_id: Uuid,
    pub steps: Vec<NewStep>,
    pub stage_policy: StagePolicies,
}

impl ResolvedRule {
    pub fn from_rule(rule: &ApprovalRule) -> ApprovalResult<Self> {
        let templates = parse_templates(&rule.steps)
            .map_err(|e| ApprovalError::InvalidRule(format!("rule '{}': {}", rule.name, e)))?;

        Ok(Self {
            rule_id: rule.id,
            steps: normalize_steps(&templates)?,
            stage_policy: normalize_stage_policy(rule.stage_policy.as_ref()),
        })
    }

    pub fn from_templates(templates: &[StepTemplate]) -> ApprovalResult<Self> {
        Ok(Self {
            rule_id: MANUAL_RULE_ID,
            steps: normalize_steps(templates)?,
            stage_policy: StagePolicies::default(),
        })
    }
}

pub fn parse_templates(value: &Value) -> Result<Vec<StepTemplate>, String> {
    serde_json::from_value(value.clone()).map_err(|e| format!("invalid step templates: {}", e))
}

/// Settle each template's stage order; a template without one takes its position (1-based).
pub fn normalize_steps(templates: &[StepTemplate]) -> ApprovalResult<Vec<NewStep>> {
    if templates.is_empty() {
        return Err(ApprovalError::InvalidRule("approval template has no steps".to_string()));
    }

    Ok(templates
        .iter()
        .enumerate()
        .map(|(index, t)| NewStep {
            step_order: t.step_order.unwrap_or(index as i32 + 1),
            approver_group_id: t.approver_group_id,
            approver_user_id: t.approver_user_id,
            role_class: t.role_class,
        })
        .collect())
}

/// Per-stage policies from a rule. Keys are stage orders; invalid entries fall back to `all`.
pub fn normalize_stage_policy(raw: Option<&Value>) -> StagePolicies {
    let mut policies = StagePolicies::default();

    let entries = match raw {
        None | Some(Value::Null) => return policies,
        Some(Value::Object(entries)) => entries,
        Some(other) => {
            tracing::warn!("Ignoring stage policy that is not an object: {}", other);
            return policies;
        }
    };

    for (key, value) in entries {
        let Ok(step_order) = key.trim().parse::<i32>() else {
            tracing::warn!("Ignoring stage policy for non-numeric stage '{}'", key);
            continue;
        };

        match StagePolicy::parse(value) {
            Ok(policy) => policies.set(step_order, policy),
            Err(e) => {
                tracing::warn!("Stage {} policy {} falls back to 'all': {}", step_order, value, e);
            }
        }
    }

    policies
}

/// Selects the active rule for a flow type.
pub struct RuleResolver {
    matcher: Arc<dyn RuleConditionMatcher>,
}

impl RuleResolver {
    pub fn new(matcher: Arc<dyn RuleConditionMatcher>) -> Self {
        Self { matcher }
    }

    /// Resolve the rule for `payload`, or `None` when the flow type has no active rule.
    pub async fn resolve(
        &self,
        conn: &mut PgConnection,
        flow_type: &str,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> ApprovalResult<Option<ResolvedRule>> {
        let payload = enrich_payload(&mut *conn, payload).await?;
        let rules = load_active_rules(&mut *conn, flow_type, now).await?;

        match self.select_rule(flow_type, &payload, &rules).await {
            Some(rule) => {
                tracing::debug!("Resolved {} approval rule '{}' ({})", flow_type, rule.name, rule.id);
                ResolvedRule::from_rule(rule).map(Some)
            }
            None => Ok(None),
        }
    }

    /// First rule whose conditions match, else the most recent rule. `rules` must be in
    /// recency order.
    pub async fn select_rule<'r>(
        &self,
        flow_type: &str,
        payload: &Value,
        rules: &'r [ApprovalRule],
    ) -> Option<&'r ApprovalRule> {
        for rule in rules {
            let conditions = rule.conditions.clone().unwrap_or(Value::Null);
            if self.matcher.matches(flow_type, payload, &conditions).await {
                return Some(rule);
            }
        }

        let fallback = rules.first();
        if let Some(rule) = fallback {
            tracing::debug!("No {} rule matched; falling back to '{}'", flow_type, rule.name);
        }
        fallback
    }
}

pub async fn load_active_rules(
    conn: &mut PgConnection,
    flow_type: &str,
    now: DateTime<Utc>,
) -> Result<Vec<ApprovalRule>, sqlx::Error> {
    sqlx::query_as::<_, ApprovalRule>(
        r#"
        SELECT id, flow_type, name, is_active, effective_from, conditions, steps, stage_policy, created_at
        FROM approval_rules
        WHERE flow_type = $1 AND is_active AND effective_from <= $2
        ORDER BY effective_from DESC, created_at DESC
        "#,
    )
    .bind(flow_type)
    .bind(now)
    .fetch_all(conn)
    .await
}

/// Add the project's type, customer and org unit to a payload carrying `project_id`.
/// Keys already in the payload win.
pub async fn enrich_payload(conn: &mut PgConnection, payload: &Value) -> Result<Value, sqlx::Error> {
    let Some(project_id) = payload_uuid(payload, "project_id") else {
        return Ok(payload.clone());
    };

    let project: Option<(Option<String>, Option<Uuid>, Option<Uuid>)> =
        sqlx::query_as("SELECT project_type, customer_id, org_unit_id FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(conn)
            .await?;

    let Some((project_type, customer_id, org_unit_id)) = project else {
        return Ok(payload.clone());
    };

    let mut enriched = payload.clone();
    if let Value::Object(map) = &mut enriched {
        let extra = [
            ("project_type", project_type.map(Value::String)),
            ("customer_id", customer_id.map(|id| Value::String(id.to_string()))),
            ("org_unit_id", org_unit_id.map(|id| Value::String(id.to_string()))),
        ];
        for (key, value) in extra {
            if let Some(value) = value {
                map.entry(key).or_insert(value);
            }
        }
    }

    Ok(enriched)
}

/// A UUID-valued payload field, if present and well-formed.
pub fn payload_uuid(payload: &Value, key: &str) -> Option<Uuid> {
    payload.get(key)?.as_str().and_then(|s| Uuid::parse_str(s).ok())
}
