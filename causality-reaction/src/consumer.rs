use futures_lite::StreamExt;
use metrics::counter;
use prost::Message;
use std::sync::Arc;
use tokio::sync::watch;

use causality_shared::clients::broker::{ack, term};
use causality_shared::types::Envelope;

use crate::actions::execute_rule_actions;
use crate::anomaly;
use crate::AppState;

/// Per-message consumer: decode (TERM on failure), evaluate rules, run
/// anomaly detection, then ACK. Rule and anomaly errors are logged, never
/// fatal — the ACK always happens once both subsystems have seen the
/// envelope.
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut consumer = match state
        .broker
        .subscribe(
            &state.config.queue_name,
            &["events.#"],
            state.config.max_concurrent_evaluations,
        )
        .await
    {
        Ok(consumer) => consumer,
        Err(e) => {
            tracing::error!(error = %e, "reaction consumer failed to subscribe");
            return;
        }
    };

    tracing::info!(queue = %state.config.queue_name, "reaction consumer started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("reaction consumer shutting down");
                break;
            }
            delivery = consumer.next() => {
                let delivery = match delivery {
                    None => break, // consumer cancelled
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "reaction consumer error");
                        continue;
                    }
                    Some(Ok(delivery)) => delivery,
                };

                let envelope = match Envelope::decode(delivery.data.as_slice()) {
                    Ok(envelope) if envelope.payload.is_some() => envelope,
                    Ok(_) => {
                        // Structurally valid protobuf without a payload
                        // variant violates the publish invariant: poison.
                        counter!("reaction_messages_terminated_total").increment(1);
                        tracing::error!(
                            routing_key = %delivery.routing_key,
                            "envelope without payload terminated"
                        );
                        if let Err(e) = term(&delivery).await {
                            tracing::error!(error = %e, "failed to terminate message");
                        }
                        continue;
                    }
                    Err(e) => {
                        counter!("reaction_messages_terminated_total").increment(1);
                        tracing::error!(
                            error = %e,
                            routing_key = %delivery.routing_key,
                            "undecodable message terminated"
                        );
                        if let Err(e) = term(&delivery).await {
                            tracing::error!(error = %e, "failed to terminate poison message");
                        }
                        continue;
                    }
                };

                process_envelope(&state, &envelope).await;
                counter!("reaction_messages_processed_total").increment(1);

                if let Err(e) = ack(&delivery).await {
                    tracing::error!(error = %e, "failed to ack message");
                }
            }
        }
    }
}

async fn process_envelope(state: &AppState, envelope: &Envelope) {
    let payload = envelope
        .payload
        .as_ref()
        .expect("consumer admits only envelopes with a payload");
    let category = payload.category();
    let event_type = payload.event_type();
    let rendered = envelope.render();

    // Rules: the snapshot is priority-ordered, so actions execute in
    // priority order. One rule's failure never shadows the rest.
    let rules = state.rule_cache.snapshot();
    for rule in rules.iter() {
        if !rule.matches(&rendered, &envelope.app_id, category, &event_type) {
            continue;
        }
        counter!("reaction_rules_matched_total").increment(1);
        tracing::debug!(
            rule_id = %rule.id,
            rule = %rule.name,
            event_id = %envelope.id,
            "rule matched"
        );
        execute_rule_actions(
            &state.pool,
            &state.broker,
            rule,
            envelope,
            &rendered,
            state.config.max_attempts,
        )
        .await;
    }
    counter!("reaction_rules_evaluated_total").increment(rules.len() as u64);

    // Anomaly detectors run independently of rule outcomes.
    let configs = state.anomaly_cache.snapshot();
    anomaly::process_event(
        &state.pool,
        &state.broker,
        &configs,
        &state.window_store,
        envelope,
        &rendered,
        category,
        &event_type,
        state.config.max_attempts,
    )
    .await;
}
