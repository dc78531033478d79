use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use dashmap::DashMap;
use diesel::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

use causality_shared::auth::{key_prefix, verify_api_key};
use causality_shared::clients::db::DbPool;
use causality_shared::errors::{AppError, ErrorCode};

use crate::models::ApiKey;
use crate::schema::api_keys;
use crate::AppState;

/// Authenticated tenant, injected into request extensions by
/// [`require_api_key`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub app_id: String,
}

struct CachedKey {
    app_id: String,
    expires_at: Instant,
}

/// Read-through API-key verifier with a short-TTL cache so the hot ingest
/// path hits the database at most once per key per TTL.
pub struct AuthService {
    pool: DbPool,
    cache: DashMap<String, CachedKey>,
    ttl: Duration,
}

impl AuthService {
    pub fn new(pool: DbPool, ttl: Duration) -> Self {
        Self {
            pool,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Resolve a raw `X-API-Key` value to its tenant. Revoked and unknown
    /// keys are indistinguishable to the caller.
    pub fn authenticate(&self, raw_key: &str) -> Result<String, AppError> {
        if !raw_key.starts_with("ck_") || raw_key.len() <= causality_shared::auth::API_KEY_PREFIX_LEN
        {
            return Err(AppError::new(ErrorCode::InvalidApiKey, "invalid API key"));
        }

        if let Some(cached) = self.cache.get(raw_key) {
            if cached.expires_at > Instant::now() {
                return Ok(cached.app_id.clone());
            }
        }

        let mut conn = self.pool.get().map_err(|e| {
            tracing::error!(error = %e, "failed to get db connection");
            AppError::internal("database connection error")
        })?;

        let candidates: Vec<ApiKey> = api_keys::table
            .filter(api_keys::key_prefix.eq(key_prefix(raw_key)))
            .filter(api_keys::revoked.eq(false))
            .load(&mut conn)?;

        for candidate in &candidates {
            if verify_api_key(&candidate.key_salt, raw_key, &candidate.key_hash) {
                // Touch last_used_at once per cache window, not per request.
                let _ = diesel::update(api_keys::table.filter(api_keys::id.eq(candidate.id)))
                    .set(api_keys::last_used_at.eq(Utc::now()))
                    .execute(&mut conn);

                self.cache.insert(
                    raw_key.to_string(),
                    CachedKey {
                        app_id: candidate.app_id.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
                return Ok(candidate.app_id.clone());
            }
        }

        Err(AppError::new(ErrorCode::InvalidApiKey, "invalid API key"))
    }
}

/// Middleware for event routes: validates `X-API-Key` and injects the
/// authenticated tenant into the request context.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let raw_key = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| AppError::new(ErrorCode::MissingApiKey, "missing X-API-Key header"))?;

    let app_id = state.auth.authenticate(&raw_key)?;
    req.extensions_mut().insert(AuthContext { app_id });

    Ok(next.run(req).await)
}

/// Middleware applying the two-tier token buckets. Runs after auth so the
/// per-tenant bucket is keyed by the authenticated `app_id`.
pub async fn enforce_rate_limit(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let app_id = req
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| ctx.app_id.clone());

    if !state.limiter.try_acquire(app_id.as_deref()) {
        return Err(AppError::new(ErrorCode::RateLimited, "rate limit exceeded"));
    }

    Ok(next.run(req).await)
}

/// Reject oversized requests off the declared length before the body is
/// read; chunked bodies are bounded by the `DefaultBodyLimit` layer.
pub async fn enforce_body_cap(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(length) = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > state.config.max_body_size {
            return Err(AppError::new(
                ErrorCode::PayloadTooLarge,
                "request body too large",
            ));
        }
    }

    Ok(next.run(req).await)
}
