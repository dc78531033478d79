use futures_lite::StreamExt;
use lapin::message::Delivery;
use lapin::options::*;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::sync::Arc;
use std::time::Duration;

/// Topic exchange carrying live events, subjects `events.{app}.{category}.{type}`
/// and derived subjects published by rule actions.
pub const EVENTS_EXCHANGE: &str = "causality.events";

/// Dead-letter exchange. Every consumer queue declares this as its DLX, so a
/// TERMed (rejected, requeue=false) message lands here with `x-death`
/// advisory headers attached by the broker.
pub const DLX_EXCHANGE: &str = "causality.dlx";

/// Long-retention dead-letter stream; subjects `dlq.{original_subject}`.
pub const DLQ_EXCHANGE: &str = "causality.dlq";

/// Queue the DLQ listener drains; bound to every subject on the DLX.
pub const DLQ_INTAKE_QUEUE: &str = "causality.dlq.intake";

/// Durable store queue behind the DLQ exchange.
pub const DLQ_STORE_QUEUE: &str = "causality.dlq.store";

/// Retention on the DLQ store queue (30 days, vs broker-default 7 on live queues).
const DLQ_RETENTION_MS: i64 = 30 * 24 * 3600 * 1000;

#[derive(Clone)]
pub struct BrokerClient {
    conn: Arc<Connection>,
    channel: Channel,
}

impl BrokerClient {
    pub async fn connect(url: &str) -> Result<Self, lapin::Error> {
        let conn = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        for exchange in [EVENTS_EXCHANGE, DLX_EXCHANGE, DLQ_EXCHANGE] {
            channel
                .exchange_declare(
                    exchange,
                    lapin::ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }

        tracing::info!(url = %url, "connected to broker");
        Ok(Self {
            conn: Arc::new(conn),
            channel,
        })
    }

    /// Publish to the events exchange and wait for the publisher confirm.
    /// Returning `Ok` means the broker has accepted the message into a
    /// durable queue.
    pub async fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<(), lapin::Error> {
        self.publish_to(EVENTS_EXCHANGE, subject, payload, content_type, None)
            .await
    }

    pub async fn publish_to(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        content_type: &str,
        headers: Option<FieldTable>,
    ) -> Result<(), lapin::Error> {
        let mut properties = BasicProperties::default()
            .with_content_type(content_type.into())
            .with_delivery_mode(2); // persistent
        if let Some(headers) = headers {
            properties = properties.with_headers(headers);
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;

        tracing::debug!(routing_key = %routing_key, exchange = %exchange, "message published");
        Ok(())
    }

    /// Declare a durable queue (dead-lettering to the DLX), bind it to the
    /// given event subjects, and start a manually-acked consumer with the
    /// given prefetch window.
    ///
    /// Every call gets its own channel: prefetch is per-channel, and
    /// concurrent workers on one channel would collide on consumer tags.
    /// The tag is left empty so the broker generates a unique one.
    pub async fn subscribe(
        &self,
        queue_name: &str,
        routing_keys: &[&str],
        prefetch: u16,
    ) -> Result<Consumer, lapin::Error> {
        let channel = self.conn.create_channel().await?;

        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(DLX_EXCHANGE)),
        );

        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await?;

        for key in routing_keys {
            channel
                .queue_bind(
                    queue_name,
                    EVENTS_EXCHANGE,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(
            queue = %queue_name,
            bindings = ?routing_keys,
            prefetch = prefetch,
            consumer_tag = %consumer.tag().as_str(),
            "subscribed to event stream"
        );

        Ok(consumer)
    }

    /// Declare the dead-letter intake and store queues. Called once by the
    /// DLQ listener before consuming.
    pub async fn declare_dlq(&self) -> Result<(), lapin::Error> {
        self.channel
            .queue_declare(
                DLQ_INTAKE_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.channel
            .queue_bind(
                DLQ_INTAKE_QUEUE,
                DLX_EXCHANGE,
                "#",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut store_args = FieldTable::default();
        store_args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(DLQ_RETENTION_MS),
        );
        self.channel
            .queue_declare(
                DLQ_STORE_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                store_args,
            )
            .await?;
        self.channel
            .queue_bind(
                DLQ_STORE_QUEUE,
                DLQ_EXCHANGE,
                "dlq.#",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Start a plain consumer on an already-declared queue, on its own
    /// channel with a broker-generated consumer tag.
    pub async fn consume(&self, queue_name: &str, prefetch: u16) -> Result<Consumer, lapin::Error> {
        let channel = self.conn.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        channel
            .basic_consume(
                queue_name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
    }

    pub fn is_connected(&self) -> bool {
        self.conn.status().connected() && self.channel.status().connected()
    }

    /// Current depth of a queue (passive declare).
    pub async fn queue_depth(&self, queue_name: &str) -> Result<u32, lapin::Error> {
        let queue = self
            .channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.message_count())
    }
}

/// Pull up to `max` deliveries from the consumer, waiting at most `max_wait`
/// for the first and draining whatever arrives before the deadline.
pub async fn fetch_batch(
    consumer: &mut Consumer,
    max: usize,
    max_wait: Duration,
) -> Vec<Result<Delivery, lapin::Error>> {
    let mut batch = Vec::new();
    let deadline = tokio::time::Instant::now() + max_wait;

    while batch.len() < max {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, consumer.next()).await {
            Ok(Some(delivery)) => batch.push(delivery),
            Ok(None) => break, // consumer cancelled
            Err(_) => break,   // max wait elapsed
        }
    }

    batch
}

/// Acknowledge: the downstream effect of this message is durable.
pub async fn ack(delivery: &Delivery) -> Result<(), lapin::Error> {
    delivery.ack(BasicAckOptions::default()).await
}

/// Negative-acknowledge with redelivery; used for transient failures.
pub async fn nak(delivery: &Delivery) -> Result<(), lapin::Error> {
    delivery
        .nack(BasicNackOptions {
            requeue: true,
            ..Default::default()
        })
        .await
}

/// Terminate a poison message: reject without requeue so the broker
/// dead-letters it to the DLX with `x-death` advisory headers.
pub async fn term(delivery: &Delivery) -> Result<(), lapin::Error> {
    delivery
        .reject(BasicRejectOptions { requeue: false })
        .await
}
