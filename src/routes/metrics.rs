use axum::extract::State;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for every metric the dispatcher emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "dispatcher_jobs_claimed_total",
        "Jobs leased by this worker"
    );
    metrics::describe_counter!(
        "dispatcher_jobs_completed_total",
        "Jobs moved to COMPLETED"
    );
    metrics::describe_counter!(
        "dispatcher_jobs_failed_total",
        "Job attempts that recorded an error"
    );
    metrics::describe_counter!(
        "dispatcher_poll_errors_total",
        "Poll cycles abandoned because the claim failed"
    );
    metrics::describe_histogram!(
        "dispatcher_generation_seconds",
        "Time spent waiting on the image generation provider"
    );
    metrics::describe_gauge!(
        "dispatcher_queue_depth",
        "Claimable jobs, sampled on each /health request"
    );
}

/// `/metrics` in Prometheus text exposition format.
pub fn router(handle: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .with_state(handle)
}

async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> String {
    handle.render()
}
