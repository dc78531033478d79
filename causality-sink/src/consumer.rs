use metrics::{counter, gauge, histogram};
use prost::Message;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;

use causality_shared::clients::broker::{ack, fetch_batch, nak, term, BrokerClient};
use causality_shared::clients::object_store::ObjectStoreClient;
use causality_shared::types::Envelope;

use crate::batch::{group_by_partition, TrackedEvent};
use crate::columnar::{compression_from_str, encode_partition};
use crate::config::AppConfig;

pub struct SinkContext {
    pub config: AppConfig,
    pub broker: BrokerClient,
    pub store: ObjectStoreClient,
    batch: Mutex<Vec<TrackedEvent>>,
    last_flush: Mutex<Instant>,
}

impl SinkContext {
    pub fn new(config: AppConfig, broker: BrokerClient, store: ObjectStoreClient) -> Self {
        Self {
            config,
            broker,
            store,
            batch: Mutex::new(Vec::new()),
            last_flush: Mutex::new(Instant::now()),
        }
    }

    fn append(&self, event: TrackedEvent) -> usize {
        let mut batch = self.batch.lock().expect("sink batch lock poisoned");
        batch.push(event);
        batch.len()
    }

    fn drain(&self) -> Vec<TrackedEvent> {
        let mut batch = self.batch.lock().expect("sink batch lock poisoned");
        std::mem::take(&mut *batch)
    }
}

/// Run the sink until shutdown: `worker_count` fetch workers feeding the
/// shared batch, a periodic flusher, and one unconditional final flush.
pub async fn run(ctx: Arc<SinkContext>, shutdown: watch::Receiver<bool>) {
    let mut workers = JoinSet::new();
    for worker_id in 0..ctx.config.worker_count {
        workers.spawn(fetch_worker(ctx.clone(), shutdown.clone(), worker_id));
    }
    workers.spawn(flush_timer(ctx.clone(), shutdown.clone()));

    while workers.join_next().await.is_some() {}

    // Final flush: anything still buffered goes out under the shutdown
    // timeout; failure leaves those messages un-ACKed for the next run.
    let deadline = Duration::from_secs(ctx.config.shutdown_timeout_secs);
    match tokio::time::timeout(deadline, flush(&ctx)).await {
        Ok(()) => tracing::info!("final flush complete"),
        Err(_) => tracing::error!("final flush exceeded shutdown timeout"),
    }
}

async fn fetch_worker(ctx: Arc<SinkContext>, shutdown: watch::Receiver<bool>, worker_id: usize) {
    let mut consumer = match ctx
        .broker
        .subscribe(
            &ctx.config.queue_name,
            &["events.#"],
            ctx.config.fetch_batch_size as u16,
        )
        .await
    {
        Ok(consumer) => consumer,
        Err(e) => {
            tracing::error!(error = %e, worker = worker_id, "sink worker failed to subscribe");
            return;
        }
    };

    let max_wait = Duration::from_secs(ctx.config.fetch_max_wait_secs);
    tracing::info!(worker = worker_id, "sink worker started");

    while !*shutdown.borrow() {
        let deliveries = fetch_batch(&mut consumer, ctx.config.fetch_batch_size, max_wait).await;

        for delivery in deliveries {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(error = %e, worker = worker_id, "sink consumer error");
                    continue;
                }
            };

            match Envelope::decode(delivery.data.as_slice()) {
                Ok(envelope) => {
                    counter!("warehouse_messages_processed_total").increment(1);
                    let len = ctx.append(TrackedEvent { envelope, delivery });
                    if len >= ctx.config.batch_max_events {
                        flush(&ctx).await;
                    }
                }
                Err(e) => {
                    // Poison pill: terminate so the broker dead-letters it
                    // instead of redelivering forever.
                    counter!("warehouse_messages_terminated_total").increment(1);
                    tracing::error!(
                        error = %e,
                        routing_key = %delivery.routing_key,
                        "undecodable message terminated"
                    );
                    if let Err(e) = term(&delivery).await {
                        tracing::error!(error = %e, "failed to terminate poison message");
                    }
                }
            }
        }
    }

    tracing::info!(worker = worker_id, "sink worker stopping");
}

async fn flush_timer(ctx: Arc<SinkContext>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(ctx.config.flush_interval_secs);
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let elapsed = ctx
                    .last_flush
                    .lock()
                    .expect("sink flush lock poisoned")
                    .elapsed();
                if elapsed >= interval {
                    flush(&ctx).await;
                }
            }
        }
    }
}

/// Swap the batch out and write it, one Parquet file per partition.
/// Partition failures are independent: a failed upload NAKs only its own
/// messages and the remaining partitions still attempt.
pub async fn flush(ctx: &SinkContext) {
    let snapshot = ctx.drain();
    *ctx.last_flush.lock().expect("sink flush lock poisoned") = Instant::now();

    if snapshot.is_empty() {
        return;
    }

    let started = Instant::now();
    let total = snapshot.len();
    gauge!("warehouse_batch_size").set(total as f64);

    let compression = compression_from_str(&ctx.config.parquet_compression);
    let partitions = group_by_partition(snapshot);
    let partition_count = partitions.len();

    for (partition, events) in partitions {
        let envelopes: Vec<Envelope> = events.iter().map(|e| e.envelope.clone()).collect();

        let encoded = match encode_partition(
            &envelopes,
            compression,
            ctx.config.parquet_row_group_size,
        ) {
            Ok(bytes) => bytes,
            Err(e) => {
                counter!("warehouse_flush_partition_failures_total").increment(1);
                tracing::error!(
                    error = %e,
                    partition = %partition.path_prefix(),
                    "parquet encode failed, requeueing partition"
                );
                nak_all(&events).await;
                continue;
            }
        };

        let file_name = format!("events_{}.parquet", random_suffix());
        let key = format!(
            "{}/{}{}",
            ctx.config.store_prefix,
            partition.path_prefix(),
            file_name
        );

        match ctx.store.put(&key, encoded.clone()).await {
            Ok(()) => {
                counter!("warehouse_files_written_total").increment(1);
                counter!("warehouse_file_bytes_total").increment(encoded.len() as u64);
                counter!("warehouse_events_persisted_total").increment(events.len() as u64);
                tracing::info!(
                    key = %key,
                    events = events.len(),
                    bytes = encoded.len(),
                    "partition flushed"
                );
                for event in &events {
                    if let Err(e) = ack(&event.delivery).await {
                        tracing::error!(error = %e, "failed to ack flushed message");
                    }
                }
            }
            Err(e) => {
                counter!("warehouse_flush_partition_failures_total").increment(1);
                tracing::error!(
                    error = %e,
                    key = %key,
                    "partition upload failed, requeueing"
                );
                nak_all(&events).await;
            }
        }
    }

    histogram!("warehouse_flush_duration_seconds").record(started.elapsed().as_secs_f64());
    tracing::debug!(
        events = total,
        partitions = partition_count,
        "flush finished"
    );
}

async fn nak_all(events: &[TrackedEvent]) {
    for event in events {
        if let Err(e) = nak(&event.delivery).await {
            tracing::error!(error = %e, "failed to nak message");
        }
    }
}

fn random_suffix() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_is_hex() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
