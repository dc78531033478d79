use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{anomaly_configs, anomaly_events, api_keys, rules, webhook_deliveries, webhooks};

// --- Rules ---

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = rules)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub app_id: Option<String>,
    pub event_category: Option<String>,
    pub event_type: Option<String>,
    pub conditions: serde_json::Value,
    pub webhook_ids: serde_json::Value,
    pub publish_subjects: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = rules)]
pub struct NewRule {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub app_id: Option<String>,
    pub event_category: Option<String>,
    pub event_type: Option<String>,
    pub conditions: serde_json::Value,
    pub webhook_ids: serde_json::Value,
    pub publish_subjects: serde_json::Value,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = rules)]
pub struct RuleChanges {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
    pub app_id: Option<String>,
    pub event_category: Option<String>,
    pub event_type: Option<String>,
    pub conditions: Option<serde_json::Value>,
    pub webhook_ids: Option<serde_json::Value>,
    pub publish_subjects: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

/// One `{path, operator, value}` predicate; a rule matches when all of its
/// conditions hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub path: String,
    pub operator: ConditionOp,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Regex,
    In,
    Exists,
    NotExists,
}

// --- Webhooks ---

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = webhooks)]
pub struct Webhook {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub auth_type: String,
    #[serde(skip_serializing)]
    pub auth_config: serde_json::Value,
    pub headers: serde_json::Value,
    pub enabled: bool,
    pub timeout_secs: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = webhooks)]
pub struct NewWebhook {
    pub name: String,
    pub url: String,
    pub auth_type: String,
    pub auth_config: serde_json::Value,
    pub headers: serde_json::Value,
    pub enabled: bool,
    pub timeout_secs: i32,
}

/// Typed view of `webhooks.auth_config`, one variant per `auth_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAuth {
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    Hmac {
        secret: String,
        #[serde(default = "default_signature_header")]
        header_name: String,
    },
}

fn default_signature_header() -> String {
    "X-Signature".to_string()
}

impl WebhookAuth {
    pub fn kind(&self) -> &'static str {
        match self {
            WebhookAuth::None => "none",
            WebhookAuth::Basic { .. } => "basic",
            WebhookAuth::Bearer { .. } => "bearer",
            WebhookAuth::Hmac { .. } => "hmac",
        }
    }
}

impl Webhook {
    pub fn auth(&self) -> WebhookAuth {
        match self.auth_type.as_str() {
            "none" => WebhookAuth::None,
            _ => serde_json::from_value(self.auth_config.clone()).unwrap_or_else(|e| {
                tracing::error!(webhook_id = %self.id, error = %e, "malformed auth config, treating as none");
                WebhookAuth::None
            }),
        }
    }
}

// --- Webhook deliveries ---

pub const DELIVERY_PENDING: &str = "pending";
pub const DELIVERY_DELIVERED: &str = "delivered";
pub const DELIVERY_DEAD_LETTER: &str = "dead_letter";

#[derive(Debug, Clone, Queryable, QueryableByName, Identifiable, Serialize)]
#[diesel(table_name = webhook_deliveries)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub anomaly_config_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_status_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = webhook_deliveries)]
pub struct NewWebhookDelivery {
    pub webhook_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub anomaly_config_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
}

// --- Anomaly configs ---

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = anomaly_configs)]
pub struct AnomalyConfig {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub app_id: Option<String>,
    pub event_category: Option<String>,
    pub event_type: Option<String>,
    pub detection_type: String,
    pub detection: serde_json::Value,
    pub cooldown_secs: i32,
    pub webhook_ids: serde_json::Value,
    pub publish_subjects: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = anomaly_configs)]
pub struct NewAnomalyConfig {
    pub name: String,
    pub enabled: bool,
    pub app_id: Option<String>,
    pub event_category: Option<String>,
    pub event_type: Option<String>,
    pub detection_type: String,
    pub detection: serde_json::Value,
    pub cooldown_secs: i32,
    pub webhook_ids: serde_json::Value,
    pub publish_subjects: serde_json::Value,
}

/// Typed view of `anomaly_configs.detection`, one variant per
/// `detection_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Detection {
    Threshold {
        path: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Rate {
        max_per_minute: i64,
    },
    Count {
        max_count: i64,
        window_secs: i64,
    },
}

impl Detection {
    pub fn kind(&self) -> &'static str {
        match self {
            Detection::Threshold { .. } => "threshold",
            Detection::Rate { .. } => "rate",
            Detection::Count { .. } => "count",
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = anomaly_events)]
pub struct NewAnomalyEvent {
    pub config_id: Uuid,
    pub app_id: String,
    pub detection_type: String,
    pub details: serde_json::Value,
}

// --- API keys ---

#[derive(Debug, Queryable, Identifiable, Serialize)]
#[diesel(table_name = api_keys)]
pub struct ApiKey {
    pub id: Uuid,
    pub app_id: String,
    pub name: String,
    pub key_prefix: String,
    #[serde(skip_serializing)]
    pub key_salt: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = api_keys)]
pub struct NewApiKey {
    pub app_id: String,
    pub name: String,
    pub key_prefix: String,
    pub key_salt: String,
    pub key_hash: String,
}

/// Parse a JSONB uuid list column, dropping malformed entries.
pub fn uuid_list(value: &serde_json::Value) -> Vec<Uuid> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

/// Parse a JSONB string list column.
pub fn string_list(value: &serde_json::Value) -> Vec<String> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}
