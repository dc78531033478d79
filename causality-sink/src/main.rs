use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

mod batch;
mod columnar;
mod config;
mod consumer;
mod routes;

use config::AppConfig;
use consumer::SinkContext;

use causality_shared::clients::broker::BrokerClient;
use causality_shared::clients::object_store::ObjectStoreClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    causality_shared::middleware::init_tracing("causality-sink");

    let config = AppConfig::load()?;
    let port = config.port;
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);

    let broker = BrokerClient::connect(&config.broker_url).await?;
    let store = ObjectStoreClient::new(
        &config.store_endpoint,
        &config.store_access_key,
        &config.store_secret_key,
        &config.store_region,
        &config.store_bucket,
    )
    .await;
    let metrics_handle = causality_shared::middleware::init_metrics();

    let ctx = Arc::new(SinkContext::new(config, broker.clone(), store));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // The sink owns the durability side of the pipeline, so the shared DLQ
    // listener runs here.
    let dlq_broker = broker.clone();
    let dlq_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = causality_shared::dlq::run_dlq_listener(dlq_broker, dlq_shutdown).await {
            tracing::error!(error = %e, "dlq listener failed");
        }
    });

    let sink_task = tokio::spawn(consumer::run(ctx.clone(), shutdown_rx));

    let http_state = Arc::new(routes::HttpState {
        ctx: ctx.clone(),
        metrics_handle,
    });
    let app = Router::new()
        .route("/health", get(routes::health_check))
        .route("/metrics", get(routes::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(http_state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "causality-sink starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP server exited on signal: stop the workers and wait out the final
    // flush under the shutdown timeout.
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(shutdown_timeout + Duration::from_secs(5), sink_task)
        .await
        .is_err()
    {
        tracing::error!("sink workers did not stop within shutdown timeout");
    }

    tracing::info!("causality-sink stopped");
    Ok(())
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
