use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use causality_gateway::auth::{enforce_body_cap, enforce_rate_limit, require_api_key, AuthService};
use causality_gateway::config::AppConfig;
use causality_gateway::rate_limit::RateLimiter;
use causality_gateway::routes::{health, ingest};
use causality_gateway::AppState;
use causality_shared::clients::broker::BrokerClient;
use causality_shared::clients::db::create_pool;
use causality_shared::dedup::DedupCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    causality_shared::middleware::init_tracing("causality-gateway");

    let config = AppConfig::load()?;
    let port = config.port;

    let pool = create_pool(&config.database_url);
    let broker = BrokerClient::connect(&config.broker_url).await?;
    let metrics_handle = causality_shared::middleware::init_metrics();

    let dedup = Arc::new(DedupCache::new(
        config.dedup_capacity,
        config.dedup_fp_rate,
    ));
    dedup.spawn_rotation(Duration::from_secs(config.dedup_window_secs));

    let limiter = RateLimiter::new(
        config.rate_limit_enabled,
        config.global_rps,
        config.global_burst,
        config.per_key_rps,
        config.per_key_burst,
    );

    let auth = AuthService::new(
        pool.clone(),
        Duration::from_secs(config.api_key_cache_ttl_secs),
    );

    let cors = if config.cors_allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins = config
            .cors_allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect::<Vec<_>>();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::AllowMethods::any())
            .allow_headers(tower_http::cors::AllowHeaders::any())
    };

    let max_body_size = config.max_body_size;
    let state = Arc::new(AppState {
        config,
        pool,
        broker,
        dedup,
        limiter,
        auth,
        metrics_handle,
    });

    // Event routes sit behind body cap -> auth -> rate limit; health paths
    // bypass all three.
    let event_routes = Router::new()
        .route("/v1/events/ingest", post(ingest::ingest_single))
        .route("/v1/events/batch", post(ingest::ingest_batch))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limit,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(middleware::from_fn_with_state(state.clone(), enforce_body_cap))
        .layer(DefaultBodyLimit::max(max_body_size));

    let app = Router::new()
        .merge(event_routes)
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .layer(middleware::from_fn(
            causality_shared::middleware::metrics_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "causality-gateway starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("causality-gateway stopped");
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
