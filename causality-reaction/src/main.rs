use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

mod actions;
mod anomaly;
mod config;
mod consumer;
mod dispatcher;
mod models;
mod routes;
mod rules;
mod schema;

use anomaly::{AnomalyConfigCache, WindowStore};
use config::AppConfig;
use rules::RuleCache;

use causality_shared::clients::broker::BrokerClient;
use causality_shared::clients::db::{create_pool, DbPool};

pub struct AppState {
    pub config: AppConfig,
    pub pool: DbPool,
    pub broker: BrokerClient,
    pub rule_cache: Arc<RuleCache>,
    pub anomaly_cache: Arc<AnomalyConfigCache>,
    pub window_store: Arc<WindowStore>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    causality_shared::middleware::init_tracing("causality-reaction");

    let config = AppConfig::load()?;
    let port = config.port;

    let pool = create_pool(&config.database_url);
    let broker = BrokerClient::connect(&config.broker_url).await?;
    let metrics_handle = causality_shared::middleware::init_metrics();

    let rule_cache = Arc::new(RuleCache::new(pool.clone()));
    let loaded = rule_cache.refresh()?;
    tracing::info!(rules = loaded, "rule cache loaded");
    rule_cache.spawn_refresh(Duration::from_secs(config.rule_refresh_interval_secs));

    let anomaly_cache = Arc::new(AnomalyConfigCache::new(pool.clone()));
    let configs = anomaly_cache.refresh()?;
    tracing::info!(configs = configs, "anomaly config cache loaded");
    anomaly_cache.spawn_refresh(Duration::from_secs(config.config_refresh_interval_secs));

    let window_store = Arc::new(WindowStore::new());
    window_store.spawn_cleanup(
        Duration::from_secs(config.state_cleanup_interval_secs),
        Duration::from_secs(config.state_retention_secs),
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        pool: pool.clone(),
        broker,
        rule_cache,
        anomaly_cache,
        window_store,
        metrics_handle,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let consumer_task = tokio::spawn(consumer::run(state.clone(), shutdown_rx.clone()));
    let dispatcher_task = tokio::spawn(dispatcher::run(
        pool,
        Arc::new(config),
        shutdown_rx,
    ));

    let admin = Router::new()
        .route(
            "/admin/rules",
            post(routes::admin::create_rule).get(routes::admin::list_rules),
        )
        .route(
            "/admin/rules/:id",
            get(routes::admin::get_rule)
                .put(routes::admin::update_rule)
                .delete(routes::admin::delete_rule),
        )
        .route(
            "/admin/webhooks",
            post(routes::admin::create_webhook).get(routes::admin::list_webhooks),
        )
        .route(
            "/admin/webhooks/:id",
            get(routes::admin::get_webhook).delete(routes::admin::delete_webhook),
        )
        .route("/admin/deliveries", get(routes::admin::list_deliveries))
        .route(
            "/admin/anomaly-configs",
            post(routes::admin::create_anomaly_config).get(routes::admin::list_anomaly_configs),
        )
        .route(
            "/admin/anomaly-configs/:id",
            delete(routes::admin::delete_anomaly_config),
        )
        .route(
            "/admin/api-keys",
            post(routes::admin::create_api_key).get(routes::admin::list_api_keys),
        )
        .route("/admin/api-keys/:id", delete(routes::admin::revoke_api_key));

    let app = Router::new()
        .merge(admin)
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::health::metrics))
        .layer(axum::middleware::from_fn(
            causality_shared::middleware::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "causality-reaction starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(
        Duration::from_secs(30),
        futures_lite::future::zip(consumer_task, dispatcher_task),
    )
    .await;

    tracing::info!("causality-reaction stopped");
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
