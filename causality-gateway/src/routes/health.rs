use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use causality_shared::{HealthCheck, HealthResponse, HealthStatus};
use std::sync::Arc;

use crate::AppState;

/// Health check probing the state store and broker bindings.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let db_check = match state.pool.get() {
        Ok(_) => HealthCheck {
            name: "database".to_string(),
            status: HealthStatus::Healthy,
            message: None,
        },
        Err(e) => HealthCheck {
            name: "database".to_string(),
            status: HealthStatus::Unhealthy,
            message: Some(format!("{e}")),
        },
    };

    let broker_check = if state.broker.is_connected() {
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

    let response = HealthResponse::healthy("causality-gateway", env!("CARGO_PKG_VERSION"))
        .with_checks(vec![db_check, broker_check]);

    let status = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(response)).into_response()
}

/// Readiness: the process is serving and wired to its dependencies.
pub async fn ready() -> StatusCode {
    StatusCode::OK
}

/// Prometheus metrics in text exposition format.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
