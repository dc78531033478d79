use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use diesel::prelude::*;
use metrics::counter;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

use causality_shared::clients::broker::BrokerClient;
use causality_shared::clients::db::DbPool;
use causality_shared::types::Envelope;

use crate::actions::{enqueue_delivery, render_subject};
use crate::models::{string_list, uuid_list, AnomalyConfig, Detection, NewAnomalyEvent};
use crate::rules::eval::walk_path;
use crate::schema::anomaly_configs;

/// An anomaly config with its detection JSONB parsed once at load time.
#[derive(Debug, Clone)]
pub struct CompiledAnomalyConfig {
    pub id: Uuid,
    pub name: String,
    pub app_id: Option<String>,
    pub event_category: Option<String>,
    pub event_type: Option<String>,
    pub detection: Detection,
    pub cooldown: ChronoDuration,
    pub webhook_ids: Vec<Uuid>,
    pub publish_subjects: Vec<String>,
}

impl CompiledAnomalyConfig {
    fn from_row(row: AnomalyConfig) -> Option<Self> {
        let detection: Detection = match serde_json::from_value(row.detection.clone()) {
            Ok(detection) => detection,
            Err(e) => {
                tracing::error!(config_id = %row.id, error = %e, "skipping anomaly config with malformed detection");
                return None;
            }
        };

        Some(Self {
            id: row.id,
            name: row.name,
            app_id: row.app_id,
            event_category: row.event_category,
            event_type: row.event_type,
            detection,
            cooldown: ChronoDuration::seconds(row.cooldown_secs as i64),
            webhook_ids: uuid_list(&row.webhook_ids),
            publish_subjects: string_list(&row.publish_subjects),
        })
    }

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
}

/// Snapshot cache over enabled anomaly configs, refreshed like the rule
/// cache.
pub struct AnomalyConfigCache {
    pool: DbPool,
    snapshot: RwLock<Arc<Vec<CompiledAnomalyConfig>>>,
}

impl AnomalyConfigCache {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn refresh(&self) -> anyhow::Result<usize> {
        let mut conn = self.pool.get()?;
        let rows: Vec<AnomalyConfig> = anomaly_configs::table
            .filter(anomaly_configs::enabled.eq(true))
            .order(anomaly_configs::name.asc())
            .load(&mut conn)?;

        let compiled: Vec<CompiledAnomalyConfig> = rows
            .into_iter()
            .filter_map(CompiledAnomalyConfig::from_row)
            .collect();
        let count = compiled.len();

        *self.snapshot.write().expect("anomaly cache lock poisoned") = Arc::new(compiled);
        Ok(count)
    }

    pub fn snapshot(&self) -> Arc<Vec<CompiledAnomalyConfig>> {
        self.snapshot
            .read()
            .expect("anomaly cache lock poisoned")
            .clone()
    }

    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match cache.refresh() {
                    Ok(count) => tracing::debug!(configs = count, "anomaly config cache refreshed"),
                    Err(e) => tracing::error!(error = %e, "anomaly config refresh failed"),
                }
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    config_id: Uuid,
    app_id: String,
    bucket: i64,
}

struct WindowEntry {
    count: i64,
    updated_at: DateTime<Utc>,
}

/// Process-local sliding-window counters and per-(config, app) alert
/// cooldowns.
pub struct WindowStore {
    counters: DashMap<WindowKey, WindowEntry>,
    last_alerts: DashMap<(Uuid, String), DateTime<Utc>>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            last_alerts: DashMap::new(),
        }
    }

    fn increment(&self, config_id: Uuid, app_id: &str, bucket: i64) -> i64 {
        let mut entry = self
            .counters
            .entry(WindowKey {
                config_id,
                app_id: app_id.to_string(),
                bucket,
            })
            .or_insert(WindowEntry {
                count: 0,
                updated_at: Utc::now(),
            });
        entry.count += 1;
        entry.updated_at = Utc::now();
        entry.count
    }

    fn in_cooldown(&self, config_id: Uuid, app_id: &str, cooldown: ChronoDuration) -> bool {
        self.last_alerts
            .get(&(config_id, app_id.to_string()))
            .map(|last| *last + cooldown > Utc::now())
            .unwrap_or(false)
    }

    fn record_alert(&self, config_id: Uuid, app_id: &str) {
        self.last_alerts
            .insert((config_id, app_id.to_string()), Utc::now());
    }

    /// Drop windows untouched for longer than the retention span.
    pub fn cleanup(&self, retention: Duration) {
        let cutoff = Utc::now() - ChronoDuration::from_std(retention).unwrap_or_default();
        self.counters.retain(|_, entry| entry.updated_at >= cutoff);
        self.last_alerts.retain(|_, last| *last >= cutoff);
    }

    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        retention: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.cleanup(retention);
                tracing::debug!("anomaly window store cleaned");
            }
        })
    }
}

impl Default for WindowStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one config's detector against one envelope. Returns alert details
/// when the detector fires; window counters are incremented as a side
/// effect for rate/count detectors.
fn detect(
    config: &CompiledAnomalyConfig,
    store: &WindowStore,
    envelope: &Envelope,
    rendered: &Value,
) -> Option<Value> {
    match &config.detection {
        Detection::Threshold { path, min, max } => {
            let value = walk_path(rendered, path)?;
            let value = match value {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.trim().parse().ok()?,
                _ => return None,
            };
            let below = min.map(|m| value < m).unwrap_or(false);
            let above = max.map(|m| value > m).unwrap_or(false);
            (below || above).then(|| {
                json!({
                    "path": path,
                    "value": value,
                    "min": min,
                    "max": max,
                })
            })
        }
        Detection::Rate { max_per_minute } => {
            let bucket = envelope.timestamp_ms / 60_000;
            let count = store.increment(config.id, &envelope.app_id, bucket);
            (count > *max_per_minute).then(|| {
                json!({
                    "count": count,
                    "max_per_minute": max_per_minute,
                    "minute_bucket": bucket,
                })
            })
        }
        Detection::Count {
            max_count,
            window_secs,
        } => {
            let window_ms = (*window_secs).max(1) * 1000;
            let bucket = envelope.timestamp_ms / window_ms;
            let count = store.increment(config.id, &envelope.app_id, bucket);
            (count > *max_count).then(|| {
                json!({
                    "count": count,
                    "max_count": max_count,
                    "window_secs": window_secs,
                    "window_bucket": bucket,
                })
            })
        }
    }
}

/// Evaluate every matching anomaly config for one envelope; fire alerts
/// (anomaly event row, webhooks, derived subjects) outside their cooldown.
/// Errors are logged and never fail the envelope.
pub async fn process_event(
    pool: &DbPool,
    broker: &BrokerClient,
    configs: &[CompiledAnomalyConfig],
    store: &WindowStore,
    envelope: &Envelope,
    rendered: &Value,
    category: &str,
    event_type: &str,
    max_attempts: i32,
) {
    for config in configs {
        if !config.matches_filter(&envelope.app_id, category, event_type) {
            continue;
        }

        let details = match detect(config, store, envelope, rendered) {
            Some(details) => details,
            None => continue,
        };

        if store.in_cooldown(config.id, &envelope.app_id, config.cooldown) {
            counter!("anomaly_alerts_suppressed_total").increment(1);
            continue;
        }
        store.record_alert(config.id, &envelope.app_id);

        counter!("anomaly_alerts_total", &[("detection", config.detection.kind().to_string())])
            .increment(1);
        tracing::warn!(
            config_id = %config.id,
            app_id = %envelope.app_id,
            detection = config.detection.kind(),
            "anomaly detected"
        );

        if let Err(e) = record_anomaly_event(pool, config, &envelope.app_id, &details) {
            tracing::error!(config_id = %config.id, error = %e, "failed to record anomaly event");
        }

        let payload = json!({
            "anomaly_config_id": config.id,
            "anomaly_config_name": config.name,
            "detection_type": config.detection.kind(),
            "app_id": envelope.app_id,
            "event_id": envelope.id,
            "details": details,
            "triggered_at": Utc::now().to_rfc3339(),
        });

        for webhook_id in &config.webhook_ids {
            if let Err(e) = enqueue_delivery(
                pool,
                *webhook_id,
                None,
                Some(config.id),
                &payload,
                max_attempts,
            ) {
                tracing::error!(
                    config_id = %config.id,
                    webhook_id = %webhook_id,
                    error = %e,
                    "failed to enqueue anomaly webhook"
                );
            }
        }

        if let Ok(body) = serde_json::to_vec(&payload) {
            for template in &config.publish_subjects {
                let subject = render_subject(template, &envelope.app_id);
                if let Err(e) = broker.publish(&subject, &body, "application/json").await {
                    tracing::error!(
                        config_id = %config.id,
                        subject = %subject,
                        error = %e,
                        "failed to publish anomaly event"
                    );
                }
            }
        }
    }
}

fn record_anomaly_event(
    pool: &DbPool,
    config: &CompiledAnomalyConfig,
    app_id: &str,
    details: &Value,
) -> anyhow::Result<()> {
    use crate::schema::anomaly_events;

    let mut conn = pool.get()?;
    diesel::insert_into(anomaly_events::table)
        .values(&NewAnomalyEvent {
            config_id: config.id,
            app_id: app_id.to_string(),
            detection_type: config.detection.kind().to_string(),
            details: details.clone(),
        })
        .execute(&mut conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(ts: i64) -> Envelope {
        serde_json::from_str(&format!(
            r#"{{"id":"e","app_id":"demo","timestamp_ms":{ts},"purchase":{{"order_id":"o","amount":250.0,"currency":"USD","quantity":1}}}}"#
        ))
        .unwrap()
    }

    fn config(detection: Detection) -> CompiledAnomalyConfig {
        CompiledAnomalyConfig {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            app_id: None,
            event_category: None,
            event_type: None,
            detection,
            cooldown: ChronoDuration::seconds(300),
            webhook_ids: vec![],
            publish_subjects: vec![],
        }
    }

    #[test]
    fn threshold_fires_outside_bounds() {
        let store = WindowStore::new();
        let env = envelope(60_000);
        let rendered = env.render();

        let high = config(Detection::Threshold {
            path: "$.purchase.amount".to_string(),
            min: None,
            max: Some(100.0),
        });
        assert!(detect(&high, &store, &env, &rendered).is_some());

        let wide = config(Detection::Threshold {
            path: "$.purchase.amount".to_string(),
            min: Some(1.0),
            max: Some(1000.0),
        });
        assert!(detect(&wide, &store, &env, &rendered).is_none());

        let missing = config(Detection::Threshold {
            path: "$.purchase.discount".to_string(),
            min: Some(1.0),
            max: None,
        });
        assert!(detect(&missing, &store, &env, &rendered).is_none());
    }

    #[test]
    fn rate_counts_per_minute_bucket() {
        let store = WindowStore::new();
        let cfg = config(Detection::Rate { max_per_minute: 2 });
        let env = envelope(60_000);
        let rendered = env.render();

        assert!(detect(&cfg, &store, &env, &rendered).is_none());
        assert!(detect(&cfg, &store, &env, &rendered).is_none());
        assert!(detect(&cfg, &store, &env, &rendered).is_some());

        // A later minute starts a fresh window.
        let later = envelope(180_000);
        let rendered_later = later.render();
        assert!(detect(&cfg, &store, &later, &rendered_later).is_none());
    }

    #[test]
    fn count_uses_configured_window() {
        let store = WindowStore::new();
        let cfg = config(Detection::Count {
            max_count: 1,
            window_secs: 600,
        });
        let first = envelope(0);
        let second = envelope(599_000); // same 10-minute window
        let third = envelope(600_000); // next window

        assert!(detect(&cfg, &store, &first, &first.render()).is_none());
        assert!(detect(&cfg, &store, &second, &second.render()).is_some());
        assert!(detect(&cfg, &store, &third, &third.render()).is_none());
    }

    #[test]
    fn cooldown_suppresses_repeat_alerts() {
        let store = WindowStore::new();
        let config_id = Uuid::new_v4();
        assert!(!store.in_cooldown(config_id, "demo", ChronoDuration::seconds(300)));
        store.record_alert(config_id, "demo");
        assert!(store.in_cooldown(config_id, "demo", ChronoDuration::seconds(300)));
        assert!(!store.in_cooldown(config_id, "other", ChronoDuration::seconds(300)));
        // Zero cooldown expires immediately.
        assert!(!store.in_cooldown(config_id, "demo", ChronoDuration::seconds(0)));
    }

    #[test]
    fn cleanup_prunes_stale_windows() {
        let store = WindowStore::new();
        let cfg = config(Detection::Rate { max_per_minute: 100 });
        let env = envelope(60_000);
        let rendered = env.render();
        detect(&cfg, &store, &env, &rendered);
        assert_eq!(store.counters.len(), 1);

        store.cleanup(Duration::from_secs(3600));
        assert_eq!(store.counters.len(), 1);

        store.cleanup(Duration::ZERO);
        assert_eq!(store.counters.len(), 0);
    }
}
