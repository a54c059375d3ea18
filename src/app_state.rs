use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// Shared state for the health routes.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub worker_id: Arc<str>,
    pub lease_timeout: Duration,
}

impl AppState {
    pub fn new(db: PgPool, worker_id: &str, lease_timeout: Duration) -> Self {
        Self {
            db,
            worker_id: Arc::from(worker_id),
            lease_timeout,
        }
    }
}
