use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use hmac::{Hmac, Mac};
use metrics::counter;
use rand::Rng;
use reqwest::Client;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use causality_shared::clients::db::DbPool;

use crate::config::AppConfig;
use crate::models::{
    Webhook, WebhookAuth, WebhookDelivery, DELIVERY_DEAD_LETTER, DELIVERY_DELIVERED,
    DELIVERY_PENDING,
};
use crate::schema::{webhook_deliveries, webhooks};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 of the payload bytes, hex-encoded.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Exponential backoff for the n-th retry (0-indexed):
/// `min(initial * multiplier^attempt, max)` plus up to 10% jitter, clamped
/// to the maximum.
pub fn backoff_delay(config: &AppConfig, attempt: u32) -> Duration {
    let initial = config.initial_backoff_ms as f64;
    let max = config.max_backoff_ms as f64;
    let base = (initial * config.backoff_multiplier.powi(attempt as i32)).min(max);
    let jitter = base * rand::thread_rng().gen_range(0.0..0.1);
    Duration::from_millis((base + jitter).min(max) as u64)
}

/// Poll-claim-deliver worker pool over the delivery table.
pub async fn run(pool: DbPool, config: Arc<AppConfig>, shutdown: watch::Receiver<bool>) {
    let client = match Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "failed to build dispatcher http client");
            return;
        }
    };

    let mut workers = tokio::task::JoinSet::new();
    for worker_id in 0..config.dispatcher_workers {
        workers.spawn(worker_loop(
            pool.clone(),
            config.clone(),
            client.clone(),
            shutdown.clone(),
            worker_id,
        ));
    }

    while workers.join_next().await.is_some() {}
    tracing::info!("webhook dispatcher stopped");
}

async fn worker_loop(
    pool: DbPool,
    config: Arc<AppConfig>,
    client: Client,
    mut shutdown: watch::Receiver<bool>,
    worker_id: usize,
) {
    let poll_interval = Duration::from_secs(config.dispatcher_poll_interval_secs);
    tracing::info!(worker = worker_id, "dispatcher worker started");

    while !*shutdown.borrow() {
        let claimed = match claim_batch(
            &pool,
            config.dispatcher_batch_size,
            config.visibility_timeout_secs as i64,
        ) {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(error = %e, "delivery claim failed");
                Vec::new()
            }
        };

        if claimed.is_empty() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        }

        for delivery in claimed {
            process_delivery(&pool, &config, &client, delivery).await;
        }
    }

    tracing::info!(worker = worker_id, "dispatcher worker stopping");
}

/// Claim due pending rows by flipping them to `in_progress` inside one
/// statement; `FOR UPDATE SKIP LOCKED` keeps concurrent workers from
/// claiming the same row. Rows stuck `in_progress` past the visibility
/// timeout (a worker crashed between claim and settle) are reclaimed the
/// same way, so no delivery is stranded short of its attempt cap.
fn claim_batch(
    pool: &DbPool,
    batch_size: i64,
    visibility_timeout_secs: i64,
) -> anyhow::Result<Vec<WebhookDelivery>> {
    let mut conn = pool.get()?;
    let claimed = diesel::sql_query(
        "UPDATE webhook_deliveries SET status = 'in_progress', updated_at = NOW() \
         WHERE id IN ( \
             SELECT id FROM webhook_deliveries \
             WHERE (status = 'pending' AND next_attempt_at <= NOW()) \
                OR (status = 'in_progress' AND updated_at < NOW() - ($2 * INTERVAL '1 second')) \
             ORDER BY next_attempt_at \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED \
         ) \
         RETURNING *",
    )
    .bind::<BigInt, _>(batch_size)
    .bind::<BigInt, _>(visibility_timeout_secs)
    .load::<WebhookDelivery>(&mut conn)?;
    Ok(claimed)
}

async fn process_delivery(pool: &DbPool, config: &AppConfig, client: &Client, delivery: WebhookDelivery) {
    let webhook = match load_webhook(pool, delivery.webhook_id) {
        Ok(Some(webhook)) => webhook,
        Ok(None) => {
            tracing::error!(
                delivery_id = %delivery.id,
                webhook_id = %delivery.webhook_id,
                "webhook no longer exists, dead-lettering delivery"
            );
            mark_dead_letter(pool, &delivery, "webhook not found", None);
            return;
        }
        Err(e) => {
            tracing::error!(delivery_id = %delivery.id, error = %e, "failed to load webhook");
            // Put the row back so a later poll retries the lookup.
            requeue_unchanged(pool, &delivery);
            return;
        }
    };

    // Disabled webhooks short-circuit as delivered without an attempt.
    if !webhook.enabled {
        mark_delivered(pool, &delivery, delivery.attempts, None);
        counter!("dispatcher_deliveries_skipped_total").increment(1);
        return;
    }

    match send(client, &webhook, &delivery).await {
        Ok(status) => {
            mark_delivered(pool, &delivery, delivery.attempts + 1, Some(status as i32));
            counter!("dispatcher_deliveries_total", &[("outcome", "delivered")]).increment(1);
            tracing::info!(
                delivery_id = %delivery.id,
                webhook_id = %webhook.id,
                status = status,
                attempts = delivery.attempts + 1,
                "webhook delivered"
            );
        }
        Err(failure) => {
            record_failure(pool, config, &delivery, &failure);
        }
    }
}

struct DeliveryFailure {
    error: String,
    status_code: Option<i32>,
}

async fn send(
    client: &Client,
    webhook: &Webhook,
    delivery: &WebhookDelivery,
) -> Result<u16, DeliveryFailure> {
    let body = serde_json::to_vec(&delivery.payload).map_err(|e| DeliveryFailure {
        error: format!("payload serialization failed: {e}"),
        status_code: None,
    })?;

    let timeout = if webhook.timeout_secs > 0 {
        Duration::from_secs(webhook.timeout_secs as u64)
    } else {
        Duration::from_secs(30)
    };

    let mut request = client
        .post(&webhook.url)
        .header("Content-Type", "application/json")
        .header("User-Agent", "Causality-Webhook/0.1")
        .timeout(timeout);

    if let Some(headers) = webhook.headers.as_object() {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                request = request.header(name, value);
            }
        }
    }

    request = match webhook.auth() {
        WebhookAuth::None => request,
        WebhookAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
        WebhookAuth::Bearer { token } => request.bearer_auth(token),
        WebhookAuth::Hmac {
            secret,
            header_name,
        } => request.header(header_name, sign_payload(&secret, &body)),
    };

    let response = request.body(body).send().await.map_err(|e| DeliveryFailure {
        error: e.to_string(),
        status_code: None,
    })?;

    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        Ok(status)
    } else {
        Err(DeliveryFailure {
            error: format!("HTTP {status}"),
            status_code: Some(status as i32),
        })
    }
}

fn load_webhook(pool: &DbPool, id: uuid::Uuid) -> anyhow::Result<Option<Webhook>> {
    let mut conn = pool.get()?;
    Ok(webhooks::table
        .find(id)
        .first::<Webhook>(&mut conn)
        .optional()?)
}

fn mark_delivered(pool: &DbPool, delivery: &WebhookDelivery, attempts: i32, status_code: Option<i32>) {
    let result = pool.get().map_err(anyhow::Error::from).and_then(|mut conn| {
        diesel::update(webhook_deliveries::table.find(delivery.id))
            .set((
                webhook_deliveries::status.eq(DELIVERY_DELIVERED),
                webhook_deliveries::attempts.eq(attempts),
                webhook_deliveries::last_status_code.eq(status_code),
                webhook_deliveries::delivered_at.eq(Utc::now()),
                webhook_deliveries::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .map_err(anyhow::Error::from)
    });
    if let Err(e) = result {
        tracing::error!(delivery_id = %delivery.id, error = %e, "failed to mark delivery delivered");
    }
}

fn mark_dead_letter(
    pool: &DbPool,
    delivery: &WebhookDelivery,
    error: &str,
    status_code: Option<i32>,
) {
    let result = pool.get().map_err(anyhow::Error::from).and_then(|mut conn| {
        diesel::update(webhook_deliveries::table.find(delivery.id))
            .set((
                webhook_deliveries::status.eq(DELIVERY_DEAD_LETTER),
                webhook_deliveries::last_error.eq(error),
                webhook_deliveries::last_status_code.eq(status_code),
                webhook_deliveries::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .map_err(anyhow::Error::from)
    });
    if let Err(e) = result {
        tracing::error!(delivery_id = %delivery.id, error = %e, "failed to dead-letter delivery");
    }
}

fn requeue_unchanged(pool: &DbPool, delivery: &WebhookDelivery) {
    let result = pool.get().map_err(anyhow::Error::from).and_then(|mut conn| {
        diesel::update(webhook_deliveries::table.find(delivery.id))
            .set((
                webhook_deliveries::status.eq(DELIVERY_PENDING),
                webhook_deliveries::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .map_err(anyhow::Error::from)
    });
    if let Err(e) = result {
        tracing::error!(delivery_id = %delivery.id, error = %e, "failed to requeue delivery");
    }
}

/// Retryable failure: bump attempts, reschedule with backoff, or
/// dead-letter once attempts reach the cap.
fn record_failure(
    pool: &DbPool,
    config: &AppConfig,
    delivery: &WebhookDelivery,
    failure: &DeliveryFailure,
) {
    let attempts = delivery.attempts + 1;

    if attempts >= delivery.max_attempts {
        counter!("dispatcher_deliveries_total", &[("outcome", "dead_letter")]).increment(1);
        tracing::error!(
            delivery_id = %delivery.id,
            attempts = attempts,
            error = %failure.error,
            "delivery exhausted all attempts"
        );
        let result = pool.get().map_err(anyhow::Error::from).and_then(|mut conn| {
            diesel::update(webhook_deliveries::table.find(delivery.id))
                .set((
                    webhook_deliveries::status.eq(DELIVERY_DEAD_LETTER),
                    webhook_deliveries::attempts.eq(attempts),
                    webhook_deliveries::last_error.eq(&failure.error),
                    webhook_deliveries::last_status_code.eq(failure.status_code),
                    webhook_deliveries::updated_at.eq(Utc::now()),
                ))
                .execute(&mut conn)
                .map_err(anyhow::Error::from)
        });
        if let Err(e) = result {
            tracing::error!(delivery_id = %delivery.id, error = %e, "failed to dead-letter delivery");
        }
        return;
    }

    let delay = backoff_delay(config, (attempts - 1) as u32);
    let next_attempt_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
    counter!("dispatcher_deliveries_total", &[("outcome", "retry")]).increment(1);
    tracing::warn!(
        delivery_id = %delivery.id,
        attempts = attempts,
        delay_ms = delay.as_millis() as u64,
        error = %failure.error,
        "delivery failed, retrying"
    );

    let result = pool.get().map_err(anyhow::Error::from).and_then(|mut conn| {
        diesel::update(webhook_deliveries::table.find(delivery.id))
            .set((
                webhook_deliveries::status.eq(DELIVERY_PENDING),
                webhook_deliveries::attempts.eq(attempts),
                webhook_deliveries::next_attempt_at.eq(next_attempt_at),
                webhook_deliveries::last_error.eq(&failure.error),
                webhook_deliveries::last_status_code.eq(failure.status_code),
                webhook_deliveries::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .map_err(anyhow::Error::from)
    });
    if let Err(e) = result {
        tracing::error!(delivery_id = %delivery.id, error = %e, "failed to reschedule delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        // Env-free load: every field has a serde default.
        let config = config::Config::builder().build().unwrap();
        config.try_deserialize().unwrap()
    }

    #[test]
    fn hmac_signature_is_deterministic_hex() {
        let sig_a = sign_payload("whsec_test", b"{\"k\":1}");
        let sig_b = sign_payload("whsec_test", b"{\"k\":1}");
        assert_eq!(sig_a, sig_b);
        assert_eq!(sig_a.len(), 64);
        assert!(sig_a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(sig_a, sign_payload("other_secret", b"{\"k\":1}"));
        assert_ne!(sig_a, sign_payload("whsec_test", b"{\"k\":2}"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = test_config();
        // Defaults: initial 1s, multiplier 2, max 60s, jitter <= 10%.
        let first = backoff_delay(&config, 0);
        assert!(first >= Duration::from_millis(1000));
        assert!(first <= Duration::from_millis(1100));

        let second = backoff_delay(&config, 1);
        assert!(second >= Duration::from_millis(2000));
        assert!(second <= Duration::from_millis(2200));

        let capped = backoff_delay(&config, 30);
        assert_eq!(capped, Duration::from_millis(60_000));
    }

    #[test]
    fn backoff_deltas_are_non_decreasing() {
        let config = test_config();
        let mut previous = Duration::ZERO;
        for attempt in 0..12 {
            let delay = backoff_delay(&config, attempt);
            // 10% jitter can never overcome a 2x multiplier step.
            assert!(delay >= previous);
            previous = Duration::from_millis(
                (config.initial_backoff_ms as f64
                    * config.backoff_multiplier.powi(attempt as i32))
                .min(config.max_backoff_ms as f64) as u64,
            );
        }
    }
}
