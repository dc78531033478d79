use futures_lite::StreamExt;
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use metrics::gauge;
use tokio::sync::watch;

use crate::clients::broker::{ack, BrokerClient, DLQ_EXCHANGE, DLQ_INTAKE_QUEUE, DLQ_STORE_QUEUE};

/// Drain the dead-letter intake queue: every message the broker dead-letters
/// (consumer TERM, queue TTL) is wrapped with `X-DLQ-*` headers and
/// republished to `dlq.{original_subject}` on the long-retention DLQ stream.
pub async fn run_dlq_listener(
    broker: BrokerClient,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    broker.declare_dlq().await?;
    let mut consumer = broker.consume(DLQ_INTAKE_QUEUE, 50).await?;

    tracing::info!(queue = DLQ_INTAKE_QUEUE, "dlq listener started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("dlq listener shutting down");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    None => break, // consumer cancelled
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "dlq consumer error");
                    }
                    Some(Ok(delivery)) => {
                        if let Err(e) = route_to_dlq(&broker, &delivery).await {
                            tracing::error!(error = %e, "failed to route message to dlq");
                            // leave un-acked; broker redelivers to the intake queue
                            continue;
                        }
                        if let Err(e) = ack(&delivery).await {
                            tracing::error!(error = %e, "failed to ack dlq intake message");
                        }
                        refresh_depth_gauge(&broker).await;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn route_to_dlq(broker: &BrokerClient, delivery: &Delivery) -> anyhow::Result<()> {
    let original_subject = delivery.routing_key.as_str().to_string();
    let (reason, attempts) = death_info(delivery);
    let failed_at = chrono::Utc::now().to_rfc3339();

    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from("X-DLQ-Original-Subject"),
        AMQPValue::LongString(LongString::from(original_subject.as_str())),
    );
    headers.insert(
        ShortString::from("X-DLQ-Reason"),
        AMQPValue::LongString(LongString::from(reason.as_str())),
    );
    headers.insert(
        ShortString::from("X-DLQ-Attempts"),
        AMQPValue::LongLongInt(attempts),
    );
    headers.insert(
        ShortString::from("X-DLQ-Failed-At"),
        AMQPValue::LongString(LongString::from(failed_at.as_str())),
    );

    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    broker
        .publish_to(
            DLQ_EXCHANGE,
            &format!("dlq.{original_subject}"),
            &delivery.data,
            &content_type,
            Some(headers),
        )
        .await?;

    metrics::counter!("dlq_messages_total", &[("subject", original_subject.clone())]).increment(1);
    tracing::warn!(
        subject = %original_subject,
        reason = %reason,
        attempts = attempts,
        "message routed to dead-letter stream"
    );

    Ok(())
}

/// Read the broker's `x-death` advisory header: delivery count and the
/// reason the message was dead-lettered.
fn death_info(delivery: &Delivery) -> (String, i64) {
    let headers = match delivery.properties.headers() {
        Some(headers) => headers,
        None => return ("rejected".to_string(), 1),
    };

    let deaths = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == "x-death")
        .map(|(_, value)| value);

    if let Some(AMQPValue::FieldArray(deaths)) = deaths {
        if let Some(AMQPValue::FieldTable(first)) = deaths.as_slice().first() {
            let mut reason = "rejected".to_string();
            let mut count = 1i64;
            for (key, value) in first.inner().iter() {
                match (key.as_str(), value) {
                    ("reason", AMQPValue::LongString(s)) => {
                        reason = String::from_utf8_lossy(s.as_bytes()).into_owned();
                    }
                    ("count", AMQPValue::LongLongInt(n)) => count = *n,
                    _ => {}
                }
            }
            return (reason, count);
        }
    }

    ("rejected".to_string(), 1)
}

async fn refresh_depth_gauge(broker: &BrokerClient) {
    match broker.queue_depth(DLQ_STORE_QUEUE).await {
        Ok(depth) => gauge!("dlq_depth").set(depth as f64),
        Err(e) => tracing::debug!(error = %e, "failed to read dlq depth"),
    }
}
