use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::PgConnection;
use uuid::Uuid;

/// Stored QA checklist of one expense.
///
/// `items` is either an object of `item -> checked` or an array of
/// `{"key": ..., "checked": ...}` entries.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QaChecklist {
    pub expense_id: Uuid,
    pub items: JsonValue,
    pub updated_by: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl QaChecklist {
    /// Item key -> checked. Entries without a boolean state count as unchecked.
    pub fn item_states(&self) -> Vec<(String, bool)> {
        match &self.items {
            JsonValue::Object(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_bool().unwrap_or(false)))
                .collect(),
            JsonValue::Array(entries) => entries
                .iter()
                .filter_map(|e| {
                    let key = e.get("key")?.as_str()?.to_string();
                    let checked = e.get("checked").and_then(JsonValue::as_bool).unwrap_or(false);
                    Some((key, checked))
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
pub trait QaChecklistService: Send + Sync {
    async fn load(&self, conn: &mut PgConnection, expense_id: Uuid) -> Result<Option<QaChecklist>, sqlx::Error>;

    fn is_complete(&self, checklist: &QaChecklist) -> bool;
}

/// Reads `expense_qa_checklists`. A checklist is complete when it has at least one
/// item, every item is checked, and every required item is present.
#[derive(Debug, Clone, Default)]
pub struct PgQaChecklistService {
    required_items: Vec<String>,
}

impl PgQaChecklistService {
    pub fn with_required_items(items: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required_items: items.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl QaChecklistService for PgQaChecklistService {
    async fn load(&self, conn: &mut PgConnection, expense_id: Uuid) -> Result<Option<QaChecklist>, sqlx::Error> {
        sqlx::query_as::<_, QaChecklist>(
            "SELECT expense_id, items, updated_by, updated_at FROM expense_qa_checklists WHERE expense_id = $1",
        )
        .bind(expense_id)
        .fetch_optional(conn)
        .await
    }

    fn is_complete(&self, checklist: &QaChecklist) -> bool {
        let states = checklist.item_states();
        if states.is_empty() || states.iter().any(|(_, checked)| !checked) {
            return false;
        }

        self.required_items
            .iter()
            .all(|required| states.iter().any(|(key, _)| key == required))
    }
}
