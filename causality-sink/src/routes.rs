use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use causality_shared::{HealthCheck, HealthResponse, HealthStatus};
use std::sync::Arc;

use crate::consumer::SinkContext;

pub struct HttpState {
    pub ctx: Arc<SinkContext>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

pub async fn health_check(State(state): State<Arc<HttpState>>) -> Response {
    let broker_check = if state.ctx.broker.is_connected() {
        HealthCheck {
            name: "broker".to_string(),
            status: HealthStatus::Healthy,
            message: None,
        }
    } else {
        HealthCheck {
            name: "broker".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some("channel disconnected".to_string()),
        }
    };

    let response = HealthResponse::healthy("causality-sink", env!("CARGO_PKG_VERSION"))
        .with_checks(vec![broker_check]);

    let status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}

pub async fn metrics(State(state): State<Arc<HttpState>>) -> String {
    state.metrics_handle.render()
}
