use axum::extract::State;
use axum::{Extension, Json};
use metrics::counter;
use prost::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use causality_shared::errors::{AppError, ErrorCode};
use causality_shared::types::Envelope;

use crate::auth::AuthContext;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub event: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub event_id: String,
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub events: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub accepted_count: usize,
    pub rejected_count: usize,
    pub results: Vec<BatchResult>,
}

#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub index: usize,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parse, validate (in contract order), and enrich one envelope.
///
/// Validation order is part of the public contract: `app_id` first, then
/// payload variant, then timestamp. Enrichment is server-authoritative and
/// runs only on envelopes that passed validation.
pub(crate) fn prepare_envelope(
    value: serde_json::Value,
    auth_app_id: &str,
    now_ms: i64,
) -> Result<Envelope, String> {
    let mut envelope: Envelope =
        serde_json::from_value(value).map_err(|e| format!("invalid envelope: {e}"))?;

    if envelope.app_id.is_empty() {
        return Err("app_id is required".to_string());
    }
    if envelope.app_id != auth_app_id {
        return Err("app_id does not match API key".to_string());
    }
    if envelope.payload.is_none() {
        return Err("event payload is required".to_string());
    }
    if envelope.timestamp_ms < 0 {
        return Err("timestamp_ms must not be negative".to_string());
    }

    envelope.enrich(now_ms);
    Ok(envelope)
}

enum Admission {
    Published(String),
    Duplicate(String),
}

/// Run one prepared envelope through dedup and publish.
async fn admit(state: &AppState, envelope: Envelope) -> Result<Admission, String> {
    // Duplicates are silently accepted: retrying SDKs must not see errors
    // for replays of an event the pipeline already owns.
    if state.dedup.is_duplicate(&envelope.idempotency_key) {
        counter!("ingest_events_deduplicated_total").increment(1);
        return Ok(Admission::Duplicate(envelope.id));
    }

    let subject = envelope.subject();
    let payload = envelope.encode_to_vec();
    match state
        .broker
        .publish(&subject, &payload, "application/x-protobuf")
        .await
    {
        Ok(()) => {
            counter!("ingest_events_published_total").increment(1);
            Ok(Admission::Published(envelope.id))
        }
        Err(e) => {
            counter!("ingest_publish_failures_total").increment(1);
            tracing::error!(error = %e, subject = %subject, "broker publish failed");
            Err("failed to publish event".to_string())
        }
    }
}

/// `POST /v1/events/ingest` — single envelope.
pub async fn ingest_single(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let envelope = prepare_envelope(body.event, &auth.app_id, now_ms)
        .map_err(AppError::Validation)?;

    let event_id = match admit(&state, envelope).await {
        Ok(Admission::Published(id)) | Ok(Admission::Duplicate(id)) => id,
        Err(msg) => return Err(AppError::new(ErrorCode::PublishFailed, msg)),
    };

    Ok(Json(IngestResponse {
        event_id,
        status: "accepted",
    }))
}

/// `POST /v1/events/batch` — up to `max_batch_events` envelopes; a bad
/// envelope is rejected at its index without failing the batch.
pub async fn ingest_batch(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    if body.events.is_empty() {
        return Err(AppError::new(
            ErrorCode::EmptyBatch,
            "batch must contain at least one event",
        ));
    }
    if body.events.len() > state.config.max_batch_events {
        return Err(AppError::new(
            ErrorCode::BatchTooLarge,
            format!(
                "batch exceeds maximum of {} events",
                state.config.max_batch_events
            ),
        ));
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut results = Vec::with_capacity(body.events.len());
    let mut accepted_count = 0;
    let mut rejected_count = 0;

    for (index, value) in body.events.into_iter().enumerate() {
        let result = match prepare_envelope(value, &auth.app_id, now_ms) {
            Err(message) => {
                rejected_count += 1;
                BatchResult {
                    index,
                    status: "rejected",
                    event_id: None,
                    error: Some(message),
                }
            }
            Ok(envelope) => match admit(&state, envelope).await {
                Ok(Admission::Published(id)) | Ok(Admission::Duplicate(id)) => {
                    accepted_count += 1;
                    BatchResult {
                        index,
                        status: "accepted",
                        event_id: Some(id),
                        error: None,
                    }
                }
                Err(message) => {
                    rejected_count += 1;
                    BatchResult {
                        index,
                        status: "rejected",
                        event_id: None,
                        error: Some(message),
                    }
                }
            },
        };
        results.push(result);
    }

    Ok(Json(BatchResponse {
        accepted_count,
        rejected_count,
        results,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW_MS: i64 = 1_706_918_400_000;

    #[test]
    fn missing_app_id_is_rejected_first() {
        let err = prepare_envelope(json!({"screen_view": {"screen_name": "home"}}), "demo", NOW_MS)
            .unwrap_err();
        assert_eq!(err, "app_id is required");
    }

    #[test]
    fn missing_payload_is_rejected() {
        let err = prepare_envelope(
            json!({"app_id": "demo", "timestamp_ms": NOW_MS}),
            "demo",
            NOW_MS,
        )
        .unwrap_err();
        assert_eq!(err, "event payload is required");
    }

    #[test]
    fn foreign_app_id_is_rejected() {
        let err = prepare_envelope(
            json!({"app_id": "other", "screen_view": {"screen_name": "home"}}),
            "demo",
            NOW_MS,
        )
        .unwrap_err();
        assert_eq!(err, "app_id does not match API key");
    }

    #[test]
    fn negative_timestamp_is_rejected() {
        let err = prepare_envelope(
            json!({"app_id": "demo", "timestamp_ms": -5, "screen_view": {"screen_name": "home"}}),
            "demo",
            NOW_MS,
        )
        .unwrap_err();
        assert_eq!(err, "timestamp_ms must not be negative");
    }

    #[test]
    fn zero_timestamp_is_server_filled() {
        let envelope = prepare_envelope(
            json!({"app_id": "demo", "timestamp_ms": 0, "screen_view": {"screen_name": "home"}}),
            "demo",
            NOW_MS,
        )
        .unwrap();
        assert_eq!(envelope.timestamp_ms, NOW_MS);
        assert!(!envelope.id.is_empty());
        assert!(!envelope.idempotency_key.is_empty());
    }

    #[test]
    fn supplied_fields_survive_enrichment() {
        let envelope = prepare_envelope(
            json!({
                "app_id": "demo",
                "id": "evt-1",
                "idempotency_key": "k1",
                "timestamp_ms": NOW_MS,
                "screen_view": {"screen_name": "home"}
            }),
            "demo",
            NOW_MS + 1000,
        )
        .unwrap();
        assert_eq!(envelope.id, "evt-1");
        assert_eq!(envelope.idempotency_key, "k1");
        assert_eq!(envelope.timestamp_ms, NOW_MS);
    }

    #[test]
    fn malformed_envelope_reports_parse_error() {
        let err = prepare_envelope(json!("not an object"), "demo", NOW_MS).unwrap_err();
        assert!(err.starts_with("invalid envelope:"));
    }
}
