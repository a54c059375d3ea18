//! Shared helpers for the database-backed integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use profile_photo_dispatcher::services::dispatcher::DispatchSettings;
use profile_photo_dispatcher::services::generation::{
    GenerationError, GenerationOutput, GenerationRequest, ImageGenerator,
};

pub const LEASE: Duration = Duration::from_secs(300);

/// Insert a QUEUED job created `age_secs` seconds ago.
pub async fn insert_job(pool: &PgPool, input_urls: Value, priority: i32, age_secs: f64) -> i64 {
    sqlx::query_scalar(
        r#"
        INSERT INTO jobs (input_urls, priority, created_at, updated_at)
        VALUES ($1, $2, NOW() - make_interval(secs => $3), NOW() - make_interval(secs => $3))
        RETURNING id
        "#,
    )
    .bind(input_urls)
    .bind(priority)
    .bind(age_secs)
    .fetch_one(pool)
    .await
    .expect("insert job")
}

pub async fn insert_detail(pool: &PgPool, job_id: i64, opt_type: &str, key: &str, value: &str) {
    sqlx::query(
        "INSERT INTO job_details (job_id, opt_type, opt_key, opt_value) VALUES ($1, $2::option_type, $3, $4)",
    )
    .bind(job_id)
    .bind(opt_type)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .expect("insert detail");
}

/// Pretend the job's lease was taken `age_secs` seconds ago.
pub async fn age_lease(pool: &PgPool, job_id: i64, age_secs: f64) {
    sqlx::query("UPDATE jobs SET locked_at = NOW() - make_interval(secs => $2) WHERE id = $1")
        .bind(job_id)
        .bind(age_secs)
        .execute(pool)
        .await
        .expect("age lease");
}

pub async fn count_prompt_details(pool: &PgPool, job_id: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM job_details WHERE job_id = $1 AND opt_type = 'prompt'")
        .bind(job_id)
        .fetch_one(pool)
        .await
        .expect("count prompt details")
}

pub fn settings(worker_id: &str) -> DispatchSettings {
    DispatchSettings {
        poll_interval: Duration::from_millis(20),
        ..DispatchSettings::new(worker_id)
    }
}

/// Generator that succeeds unless the job id is on its failure list, and
/// remembers every request it receives.
#[derive(Clone, Default)]
pub struct ScriptedGenerator {
    failing: Arc<Mutex<HashSet<i64>>>,
    calls: Arc<Mutex<Vec<GenerationRequest>>>,
}

impl ScriptedGenerator {
    pub fn failing_for(job_ids: &[i64]) -> Self {
        let generator = Self::default();
        generator.failing.lock().unwrap().extend(job_ids);
        generator
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, job_id: i64) -> usize {
        self.calls().iter().filter(|r| r.job_id == job_id).count()
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        self.calls.lock().unwrap().push(request.clone());

        if self.failing.lock().unwrap().contains(&request.job_id) {
            return Err(GenerationError::Provider {
                status: 500,
                body: "provider exploded".to_string(),
            });
        }

        Ok(GenerationOutput {
            output_urls: vec![format!("https://cdn.example.com/{}/0.png", request.job_id)],
        })
    }
}
