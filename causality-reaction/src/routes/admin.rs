use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use causality_shared::errors::{AppError, AppResult, ErrorCode};
use causality_shared::ApiResponse;

use crate::models::{
    AnomalyConfig, ApiKey, Condition, Detection, NewAnomalyConfig, NewApiKey, NewRule, NewWebhook,
    Rule, RuleChanges, Webhook, WebhookAuth, WebhookDelivery,
};
use crate::schema::{anomaly_configs, api_keys, rules, webhook_deliveries, webhooks};
use crate::AppState;

// --- Rules ---

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub event_category: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub webhook_ids: Vec<Uuid>,
    #[serde(default)]
    pub publish_subjects: Vec<String>,
}

fn default_true() -> bool {
    true
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRuleRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<Rule>>)> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;

    let rule: Rule = diesel::insert_into(rules::table)
        .values(&NewRule {
            name: body.name,
            priority: body.priority,
            enabled: body.enabled,
            app_id: body.app_id,
            event_category: body.event_category,
            event_type: body.event_type,
            conditions: serde_json::to_value(&body.conditions).unwrap_or(json!([])),
            webhook_ids: serde_json::to_value(&body.webhook_ids).unwrap_or(json!([])),
            publish_subjects: serde_json::to_value(&body.publish_subjects).unwrap_or(json!([])),
        })
        .get_result(&mut conn)?;

    tracing::info!(rule_id = %rule.id, name = %rule.name, "rule created");
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(rule))))
}

pub async fn list_rules(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<Vec<Rule>>>> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let items = rules::table
        .order((rules::priority.desc(), rules::name.asc()))
        .load::<Rule>(&mut conn)?;
    Ok(Json(ApiResponse::ok(items)))
}

pub async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Rule>>> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let rule = rules::table
        .find(id)
        .first::<Rule>(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::new(ErrorCode::RuleNotFound, "rule not found"))?;
    Ok(Json(ApiResponse::ok(rule)))
}

/// Partial update; absent fields are left unchanged. Clearing a filter
/// field back to wildcard means recreating the rule.
#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
    pub app_id: Option<String>,
    pub event_category: Option<String>,
    pub event_type: Option<String>,
    pub conditions: Option<Vec<Condition>>,
    pub webhook_ids: Option<Vec<Uuid>>,
    pub publish_subjects: Option<Vec<String>>,
}

pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateRuleRequest>,
) -> AppResult<Json<ApiResponse<Rule>>> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;

    let changes = RuleChanges {
        name: body.name,
        priority: body.priority,
        enabled: body.enabled,
        app_id: body.app_id,
        event_category: body.event_category,
        event_type: body.event_type,
        conditions: body.conditions.map(|c| serde_json::to_value(c).unwrap_or(json!([]))),
        webhook_ids: body.webhook_ids.map(|w| serde_json::to_value(w).unwrap_or(json!([]))),
        publish_subjects: body
            .publish_subjects
            .map(|s| serde_json::to_value(s).unwrap_or(json!([]))),
        updated_at: Utc::now(),
    };

    let rule = diesel::update(rules::table.find(id))
        .set(&changes)
        .get_result::<Rule>(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::new(ErrorCode::RuleNotFound, "rule not found"))?;

    Ok(Json(ApiResponse::ok(rule)))
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let deleted = diesel::delete(rules::table.find(id)).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::new(ErrorCode::RuleNotFound, "rule not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// --- Webhooks ---

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub name: String,
    pub url: String,
    #[serde(default = "default_auth")]
    pub auth: WebhookAuth,
    #[serde(default)]
    pub headers: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: i32,
}

fn default_auth() -> WebhookAuth {
    WebhookAuth::None
}

fn default_timeout_secs() -> i32 {
    30
}

pub async fn create_webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateWebhookRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<Webhook>>)> {
    if !body.url.starts_with("http://") && !body.url.starts_with("https://") {
        return Err(AppError::bad_request(
            "webhook URL must start with http:// or https://",
        ));
    }

    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let webhook: Webhook = diesel::insert_into(webhooks::table)
        .values(&NewWebhook {
            name: body.name,
            url: body.url,
            auth_type: body.auth.kind().to_string(),
            auth_config: serde_json::to_value(&body.auth).unwrap_or(json!({"type": "none"})),
            headers: serde_json::Value::Object(body.headers),
            enabled: body.enabled,
            timeout_secs: body.timeout_secs,
        })
        .get_result(&mut conn)?;

    tracing::info!(webhook_id = %webhook.id, url = %webhook.url, "webhook created");
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(webhook))))
}

pub async fn list_webhooks(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<Vec<Webhook>>>> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let items = webhooks::table
        .order(webhooks::name.asc())
        .load::<Webhook>(&mut conn)?;
    Ok(Json(ApiResponse::ok(items)))
}

pub async fn get_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ApiResponse<Webhook>>> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let webhook = webhooks::table
        .find(id)
        .first::<Webhook>(&mut conn)
        .optional()?
        .ok_or_else(|| AppError::new(ErrorCode::WebhookNotFound, "webhook not found"))?;
    Ok(Json(ApiResponse::ok(webhook)))
}

pub async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let deleted = diesel::delete(webhooks::table.find(id)).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::new(ErrorCode::WebhookNotFound, "webhook not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DeliveryFilter {
    pub status: Option<String>,
    #[serde(default = "default_delivery_limit")]
    pub limit: i64,
}

fn default_delivery_limit() -> i64 {
    100
}

pub async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<DeliveryFilter>,
) -> AppResult<Json<ApiResponse<Vec<WebhookDelivery>>>> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let mut query = webhook_deliveries::table
        .order(webhook_deliveries::created_at.desc())
        .limit(filter.limit.clamp(1, 1000))
        .into_boxed();
    if let Some(status) = filter.status {
        query = query.filter(webhook_deliveries::status.eq(status));
    }
    let items = query.load::<WebhookDelivery>(&mut conn)?;
    Ok(Json(ApiResponse::ok(items)))
}

// --- Anomaly configs ---

#[derive(Debug, Deserialize)]
pub struct CreateAnomalyConfigRequest {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub event_category: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    pub detection: Detection,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i32,
    #[serde(default)]
    pub webhook_ids: Vec<Uuid>,
    #[serde(default)]
    pub publish_subjects: Vec<String>,
}

fn default_cooldown_secs() -> i32 {
    300
}

pub async fn create_anomaly_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateAnomalyConfigRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<AnomalyConfig>>)> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let config: AnomalyConfig = diesel::insert_into(anomaly_configs::table)
        .values(&NewAnomalyConfig {
            name: body.name,
            enabled: body.enabled,
            app_id: body.app_id,
            event_category: body.event_category,
            event_type: body.event_type,
            detection_type: body.detection.kind().to_string(),
            detection: serde_json::to_value(&body.detection)
                .map_err(|e| AppError::bad_request(format!("invalid detection: {e}")))?,
            cooldown_secs: body.cooldown_secs,
            webhook_ids: serde_json::to_value(&body.webhook_ids).unwrap_or(json!([])),
            publish_subjects: serde_json::to_value(&body.publish_subjects).unwrap_or(json!([])),
        })
        .get_result(&mut conn)?;

    tracing::info!(config_id = %config.id, name = %config.name, "anomaly config created");
    Ok((StatusCode::CREATED, Json(ApiResponse::ok(config))))
}

pub async fn list_anomaly_configs(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<Vec<AnomalyConfig>>>> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let items = anomaly_configs::table
        .order(anomaly_configs::name.asc())
        .load::<AnomalyConfig>(&mut conn)?;
    Ok(Json(ApiResponse::ok(items)))
}

pub async fn delete_anomaly_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let deleted = diesel::delete(anomaly_configs::table.find(id)).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::new(
            ErrorCode::AnomalyConfigNotFound,
            "anomaly config not found",
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

// --- API keys ---

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub app_id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CreatedApiKey {
    pub id: Uuid,
    pub app_id: String,
    pub name: String,
    /// Returned exactly once; only the salted hash is stored.
    pub key: String,
}

pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateApiKeyRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<CreatedApiKey>>)> {
    if body.app_id.is_empty() {
        return Err(AppError::bad_request("app_id is required"));
    }

    let generated = causality_shared::auth::generate_api_key();
    let mut conn = state.pool.get().map_err(db_unavailable)?;

    let key: ApiKey = diesel::insert_into(api_keys::table)
        .values(&NewApiKey {
            app_id: body.app_id,
            name: body.name,
            key_prefix: generated.prefix,
            key_salt: generated.salt,
            key_hash: generated.hash,
        })
        .get_result(&mut conn)?;

    tracing::info!(key_id = %key.id, app_id = %key.app_id, "api key created");
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok_with_message(
            CreatedApiKey {
                id: key.id,
                app_id: key.app_id,
                name: key.name,
                key: generated.plaintext,
            },
            "store this key now; it is not retrievable later",
        )),
    ))
}

pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<ApiResponse<Vec<ApiKey>>>> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let items = api_keys::table
        .order(api_keys::created_at.desc())
        .load::<ApiKey>(&mut conn)?;
    Ok(Json(ApiResponse::ok(items)))
}

/// Revoke (not delete): the gateway's cache TTL bounds how long a revoked
/// key keeps working.
pub async fn revoke_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.pool.get().map_err(db_unavailable)?;
    let updated = diesel::update(api_keys::table.find(id))
        .set(api_keys::revoked.eq(true))
        .execute(&mut conn)?;
    if updated == 0 {
        return Err(AppError::new(ErrorCode::ApiKeyNotFound, "api key not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

fn db_unavailable<E: std::fmt::Display>(e: E) -> AppError {
    tracing::error!(error = %e, "failed to get db connection");
    AppError::internal("database connection error")
}
