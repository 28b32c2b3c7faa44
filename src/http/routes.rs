//! Route registration.
//!
//! Every request passes the `global` limiter. The uploads group additionally
//! passes the `uploads` limiter, installed as a route layer so its keys carry
//! the matched route template.

use axum::{
    http::{header, HeaderName, Method},
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::middleware::{enforce, Admission};
use crate::config::RateLimitsConfig;
use crate::error::Result;
use crate::ratelimit::RateLimiter;
use crate::store::CounterStore;

/// The limiters for each route group.
#[derive(Debug, Clone)]
pub struct RouteLimiters {
    pub global: Arc<RateLimiter>,
    pub uploads: Arc<RateLimiter>,
}

impl RouteLimiters {
    /// Build one limiter per configured group, all sharing `store`.
    pub fn from_config(
        config: &RateLimitsConfig,
        store: Arc<dyn CounterStore>,
        atomic_expiry: bool,
    ) -> Result<Self> {
        let global = RateLimiter::new(
            "global",
            config.global.strategy,
            config.global.limit_config()?,
            store.clone(),
        )
        .with_atomic_expiry(atomic_expiry);

        let uploads = RateLimiter::new(
            "uploads",
            config.uploads.strategy,
            config.uploads.limit_config()?,
            store,
        )
        .with_atomic_expiry(atomic_expiry);

        Ok(Self {
            global: Arc::new(global),
            uploads: Arc::new(uploads),
        })
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-username"),
        ])
}

/// Build the service router.
pub fn router(limiters: &RouteLimiters, trust_forwarded_for: bool) -> Router {
    let admission = |limiter: &Arc<RateLimiter>| {
        Admission::new(limiter.clone()).trust_forwarded_for(trust_forwarded_for)
    };

    let uploads_admission = admission(&limiters.uploads);
    let uploads = Router::new()
        .route("/", post(handlers::upload))
        .route("/:id", put(handlers::resume_upload))
        .route("/:id/status", get(handlers::upload_status))
        .route_layer(from_fn_with_state(uploads_admission.clone(), enforce));

    let storage = Router::new().route(
        "/:id",
        get(handlers::download).delete(handlers::delete),
    );

    let moderation = Router::new()
        .route("/check", post(handlers::moderate))
        .route("/:id/result", get(handlers::moderation_result));

    let v1 = Router::new()
        .route("/", get(handlers::api_info))
        .nest("/uploads", uploads)
        .nest("/storage", storage)
        .nest("/moderation", moderation);

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", v1)
        // A nested "/" route only matches without the trailing slash.
        .route("/api/v1/", get(handlers::api_info))
        .route(
            "/api/v1/uploads/",
            post(handlers::upload).route_layer(from_fn_with_state(uploads_admission, enforce)),
        )
        .layer(from_fn_with_state(admission(&limiters.global), enforce))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}
