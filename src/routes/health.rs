use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::db::queries;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub ok: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub worker_id: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub queue: QueueHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    /// QUEUED jobs without a live lease
    pub depth: Option<i64>,
}

/// GET /healthz — process is up.
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { ok: true })
}

/// GET /health — database reachability and claimable queue depth.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let db_check = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Health check database ping failed");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    };

    let depth = match queries::queue_depth(&state.db, state.lease_timeout).await {
        Ok(depth) => {
            metrics::gauge!("dispatcher_queue_depth").set(depth as f64);
            Some(depth)
        }
        Err(_) => None,
    };

    let healthy = db_check.status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        worker_id: state.worker_id.to_string(),
        checks: HealthChecks {
            database: db_check,
            queue: QueueHealth { depth },
        },
    };

    (status_code, Json(response))
}
