use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

mod compactor;
mod config;

use config::AppConfig;

use causality_shared::clients::object_store::ObjectStoreClient;
use causality_shared::HealthResponse;

struct HttpState {
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    causality_shared::middleware::init_tracing("causality-compactor");

    let config = AppConfig::load()?;
    let port = config.port;

    let store = ObjectStoreClient::new(
        &config.store_endpoint,
        &config.store_access_key,
        &config.store_secret_key,
        &config.store_region,
        &config.store_bucket,
    )
    .await;
    let metrics_handle = causality_shared::middleware::init_metrics();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweep_task = tokio::spawn(sweep_loop(store, config.clone(), shutdown_rx));

    let state = Arc::new(HttpState { metrics_handle });
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "causality-compactor starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(30), sweep_task).await;

    tracing::info!("causality-compactor stopped");
    Ok(())
}

async fn sweep_loop(
    store: ObjectStoreClient,
    config: AppConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("compactor sweep loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                tracing::info!("compaction sweep starting");
                match compactor::run_once(&store, &config).await {
                    Ok(stats) => {
                        tracing::info!(
                            scanned = stats.partitions_scanned,
                            compacted = stats.partitions_compacted,
                            files_merged = stats.files_merged,
                            files_written = stats.files_written,
                            "compaction sweep finished"
                        );
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "compaction sweep failed");
                    }
                }
            }
        }
    }
}

async fn health_check() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse::healthy(
        "causality-compactor",
        env!("CARGO_PKG_VERSION"),
    ))
}

async fn metrics(
    axum::extract::State(state): axum::extract::State<Arc<HttpState>>,
) -> String {
    state.metrics_handle.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
