use diesel::prelude::*;
use metrics::gauge;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

use causality_shared::clients::db::DbPool;

use crate::models::{string_list, uuid_list, Condition, Rule};
use crate::rules::eval::evaluate_conditions;
use crate::schema::rules;

/// A rule with its JSONB columns parsed once at load time.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub app_id: Option<String>,
    pub event_category: Option<String>,
    pub event_type: Option<String>,
    pub conditions: Vec<Condition>,
    pub webhook_ids: Vec<Uuid>,
    pub publish_subjects: Vec<String>,
}

impl CompiledRule {
    fn from_row(row: Rule) -> Option<Self> {
        let conditions: Vec<Condition> = match serde_json::from_value(row.conditions.clone()) {
            Ok(conditions) => conditions,
            Err(e) => {
                tracing::error!(rule_id = %row.id, error = %e, "skipping rule with malformed conditions");
                return None;
            }
        };

        Some(Self {
            id: row.id,
            name: row.name,
            priority: row.priority,
            app_id: row.app_id,
            event_category: row.event_category,
            event_type: row.event_type,
            conditions,
            webhook_ids: uuid_list(&row.webhook_ids),
            publish_subjects: string_list(&row.publish_subjects),
        })
    }

    /// Null filter fields are wildcards; present fields must equal the
    /// envelope's values.
    pub fn matches_filter(&self, app_id: &str, category: &str, event_type: &str) -> bool {
        if let Some(filter) = &self.app_id {
            if filter != app_id {
                return false;
            }
        }
        if let Some(filter) = &self.event_category {
            if filter != category {
                return false;
            }
        }
        if let Some(filter) = &self.event_type {
            if filter != event_type {
                return false;
            }
        }
        true
    }

    pub fn matches(
        &self,
        rendered: &serde_json::Value,
        app_id: &str,
        category: &str,
        event_type: &str,
    ) -> bool {
        self.matches_filter(app_id, category, event_type)
            && evaluate_conditions(rendered, &self.conditions)
    }
}

/// Snapshot cache over enabled rules. Refresh replaces the whole `Arc`, so
/// an evaluation in flight keeps the snapshot it started with.
pub struct RuleCache {
    pool: DbPool,
    snapshot: RwLock<Arc<Vec<CompiledRule>>>,
}

impl RuleCache {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Reload enabled rules, priority descending (name ascending as a
    /// deterministic tie-break). Action execution walks this order.
    pub fn refresh(&self) -> anyhow::Result<usize> {
        let mut conn = self.pool.get()?;
        let rows: Vec<Rule> = rules::table
            .filter(rules::enabled.eq(true))
            .order((rules::priority.desc(), rules::name.asc()))
            .load(&mut conn)?;

        let compiled: Vec<CompiledRule> =
            rows.into_iter().filter_map(CompiledRule::from_row).collect();
        let count = compiled.len();

        *self.snapshot.write().expect("rule cache lock poisoned") = Arc::new(compiled);
        gauge!("reaction_rules_loaded").set(count as f64);

        Ok(count)
    }

    pub fn snapshot(&self) -> Arc<Vec<CompiledRule>> {
        self.snapshot
            .read()
            .expect("rule cache lock poisoned")
            .clone()
    }

    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match cache.refresh() {
                    Ok(count) => tracing::debug!(rules = count, "rule cache refreshed"),
                    Err(e) => tracing::error!(error = %e, "rule cache refresh failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConditionOp;
    use serde_json::json;

    fn compiled(
        app_id: Option<&str>,
        category: Option<&str>,
        event_type: Option<&str>,
    ) -> CompiledRule {
        CompiledRule {
            id: Uuid::nil(),
            name: "r".to_string(),
            priority: 0,
            app_id: app_id.map(str::to_string),
            event_category: category.map(str::to_string),
            event_type: event_type.map(str::to_string),
            conditions: vec![],
            webhook_ids: vec![],
            publish_subjects: vec![],
        }
    }

    #[test]
    fn null_filter_fields_are_wildcards() {
        let rule = compiled(None, None, None);
        assert!(rule.matches_filter("demo", "revenue", "purchase"));
    }

    #[test]
    fn present_filter_fields_must_match() {
        let rule = compiled(Some("demo"), Some("revenue"), None);
        assert!(rule.matches_filter("demo", "revenue", "purchase"));
        assert!(rule.matches_filter("demo", "revenue", "refund"));
        assert!(!rule.matches_filter("other", "revenue", "purchase"));
        assert!(!rule.matches_filter("demo", "lifecycle", "purchase"));
    }

    #[test]
    fn matches_combines_filter_and_conditions() {
        let mut rule = compiled(Some("demo"), None, None);
        rule.conditions = vec![Condition {
            path: "$.purchase.amount".to_string(),
            operator: ConditionOp::Gt,
            value: json!(100),
        }];

        let rendered = json!({"app_id": "demo", "purchase": {"amount": 150}});
        assert!(rule.matches(&rendered, "demo", "revenue", "purchase"));

        let cheap = json!({"app_id": "demo", "purchase": {"amount": 50}});
        assert!(!rule.matches(&cheap, "demo", "revenue", "purchase"));
    }

    #[test]
    fn malformed_conditions_drop_the_rule() {
        let row = Rule {
            id: Uuid::nil(),
            name: "bad".to_string(),
            priority: 0,
            enabled: true,
            app_id: None,
            event_category: None,
            event_type: None,
            conditions: json!({"not": "a list"}),
            webhook_ids: json!([]),
            publish_subjects: json!([]),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(CompiledRule::from_row(row).is_none());
    }
}
