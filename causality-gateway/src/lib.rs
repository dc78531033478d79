pub mod auth;
pub mod config;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod schema;

use std::sync::Arc;

use causality_shared::clients::broker::BrokerClient;
use causality_shared::clients::db::DbPool;
use causality_shared::dedup::DedupCache;

pub struct AppState {
    pub config: config::AppConfig,
    pub pool: DbPool,
    pub broker: BrokerClient,
    pub dedup: Arc<DedupCache>,
    pub limiter: rate_limit::RateLimiter,
    pub auth: auth::AuthService,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}
