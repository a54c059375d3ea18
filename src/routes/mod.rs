use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

pub mod health;
pub mod metrics;

/// Liveness and readiness routes. `/metrics` is attached separately by the
/// binary because it needs the process-wide Prometheus handle.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::liveness))
        .route("/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
