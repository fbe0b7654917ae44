//! HTTP surface: the versioned DORA routes plus process health.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod rate_limit;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::get;
use axum::{middleware, Router};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{DoraError, DoraResult};
use crate::metrics::MetricsService;

pub use error::ApiError;
pub use rate_limit::RateLimiter;

pub const API_PREFIX: &str = "/api/v1/dora";

#[derive(Clone)]
pub struct AppState {
    pub service: MetricsService,
    pub limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(service: MetricsService, limiter: RateLimiter) -> Self {
        Self {
            service,
            limiter: Arc::new(limiter),
            started_at: Instant::now(),
        }
    }
}

fn dora_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/{org}/deployment-frequency",
            get(handlers::deployment_frequency),
        )
        .route(
            "/{org}/change-failure-rate",
            get(handlers::change_failure_rate),
        )
        .route(
            "/{org}/lead-time-for-changes",
            get(handlers::lead_time_for_changes),
        )
        .route(
            "/{org}/mean-time-to-restore",
            get(handlers::mean_time_to_restore),
        )
        .route("/{org}/summary", get(handlers::summary))
        .route("/{org}/filters", get(handlers::filters))
        .route("/{org}/health", get(handlers::organization_health))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.limiter),
            rate_limit::enforce,
        ))
}

/// Build the application router. Fails only on an unusable CORS origin.
pub fn build_router(state: AppState, cors_origin: &str) -> DoraResult<Router> {
    let origin = HeaderValue::from_str(cors_origin)
        .map_err(|_| DoraError::Config(format!("invalid CORS origin `{cors_origin}`")))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(extractors::ORGANIZATION_HEADER),
        ]);

    Ok(Router::new()
        .route("/health", get(handlers::service_health))
        .nest(API_PREFIX, dora_routes(&state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state))
}
