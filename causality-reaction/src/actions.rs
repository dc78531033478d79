use chrono::Utc;
use diesel::prelude::*;
use metrics::counter;
use serde_json::{json, Value};
use uuid::Uuid;

use causality_shared::clients::broker::BrokerClient;
use causality_shared::clients::db::DbPool;
use causality_shared::types::{sanitize_app_id, Envelope};

use crate::models::{NewWebhookDelivery, DELIVERY_PENDING};
use crate::rules::CompiledRule;
use crate::schema::webhook_deliveries;

/// Canonical payload delivered to webhooks and derived subjects when a rule
/// matches.
pub fn build_action_payload(rule: &CompiledRule, envelope: &Envelope, rendered: &Value) -> Value {
    json!({
        "rule_id": rule.id,
        "rule_name": rule.name,
        "event_id": envelope.id,
        "app_id": envelope.app_id,
        "device_id": envelope.device_id,
        "timestamp_ms": envelope.timestamp_ms,
        "correlation_id": envelope.correlation_id,
        "event": rendered,
        "triggered_at": Utc::now().to_rfc3339(),
    })
}

/// Substitute `{app_id}` in a subject template with the sanitized tenant id.
pub fn render_subject(template: &str, app_id: &str) -> String {
    template.replace("{app_id}", &sanitize_app_id(app_id))
}

/// Insert one `pending` delivery row; the dispatcher owns it from here.
pub fn enqueue_delivery(
    pool: &DbPool,
    webhook_id: Uuid,
    rule_id: Option<Uuid>,
    anomaly_config_id: Option<Uuid>,
    payload: &Value,
    max_attempts: i32,
) -> anyhow::Result<()> {
    let mut conn = pool.get()?;
    diesel::insert_into(webhook_deliveries::table)
        .values(&NewWebhookDelivery {
            webhook_id,
            rule_id,
            anomaly_config_id,
            payload: payload.clone(),
            status: DELIVERY_PENDING.to_string(),
            attempts: 0,
            max_attempts,
            next_attempt_at: Utc::now(),
        })
        .execute(&mut conn)?;
    Ok(())
}

/// Execute a matched rule's actions in listed order. Webhook enqueue
/// failures and publish failures are logged and independent: neither blocks
/// the other, and neither fails the envelope.
pub async fn execute_rule_actions(
    pool: &DbPool,
    broker: &BrokerClient,
    rule: &CompiledRule,
    envelope: &Envelope,
    rendered: &Value,
    max_attempts: i32,
) {
    let payload = build_action_payload(rule, envelope, rendered);

    for webhook_id in &rule.webhook_ids {
        match enqueue_delivery(pool, *webhook_id, Some(rule.id), None, &payload, max_attempts) {
            Ok(()) => {
                counter!("reaction_deliveries_enqueued_total").increment(1);
            }
            Err(e) => {
                tracing::error!(
                    rule_id = %rule.id,
                    webhook_id = %webhook_id,
                    error = %e,
                    "failed to enqueue webhook delivery"
                );
            }
        }
    }

    let body = match serde_json::to_vec(&payload) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(rule_id = %rule.id, error = %e, "failed to serialize action payload");
            return;
        }
    };

    for template in &rule.publish_subjects {
        let subject = render_subject(template, &envelope.app_id);
        match broker.publish(&subject, &body, "application/json").await {
            Ok(()) => {
                counter!("reaction_derived_events_total").increment(1);
            }
            Err(e) => {
                tracing::error!(
                    rule_id = %rule.id,
                    subject = %subject,
                    error = %e,
                    "failed to publish derived event"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_template_substitution() {
        assert_eq!(
            render_subject("reactions.vip.{app_id}", "com.acme.shop"),
            "reactions.vip.com_acme_shop"
        );
        assert_eq!(render_subject("reactions.static", "demo"), "reactions.static");
    }

    #[test]
    fn action_payload_carries_envelope_identity() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"id":"evt-1","app_id":"demo","device_id":"d1","timestamp_ms":5,"screen_view":{"screen_name":"home"}}"#,
        )
        .unwrap();
        let rendered = envelope.render();
        let rule = CompiledRule {
            id: Uuid::nil(),
            name: "vip".to_string(),
            priority: 10,
            app_id: None,
            event_category: None,
            event_type: None,
            conditions: vec![],
            webhook_ids: vec![],
            publish_subjects: vec![],
        };

        let payload = build_action_payload(&rule, &envelope, &rendered);
        assert_eq!(payload["rule_name"], "vip");
        assert_eq!(payload["event_id"], "evt-1");
        assert_eq!(payload["app_id"], "demo");
        assert_eq!(payload["event"]["screen_view"]["screen_name"], "home");
        assert!(payload["triggered_at"].is_string());
    }
}
