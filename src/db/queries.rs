//! Queue store operations over `jobs` and `job_details`.
//!
//! Single-statement operations accept any executor so callers decide the
//! transaction boundary. `claim_batch` is the only mutual-exclusion
//! primitive: rows are picked with `FOR UPDATE SKIP LOCKED` and stamped with
//! a lease in the same statement.

use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, PgExecutor, Row};
use std::time::Duration;

use crate::models::job::{Job, JobStatus};
use crate::models::options::JobDetails;

const JOB_COLUMNS: &str = "id, auth_user_id, status::text AS status, input_urls, output_urls, \
     error_msg, priority, attempts, locked_by, locked_at, created_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(Job {
        id: row.try_get("id")?,
        auth_user_id: row.try_get("auth_user_id")?,
        status,
        input_urls: row.try_get("input_urls")?,
        output_urls: row.try_get("output_urls")?,
        error_msg: row.try_get("error_msg")?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Lease up to `limit` claimable jobs for `worker_id`.
///
/// A job is claimable when it is QUEUED and either unleased or leased longer
/// ago than `lease_timeout`. Rows locked by a concurrent claimer are skipped.
/// Claimed rows get `locked_by`, `locked_at = now()` and one more attempt,
/// and come back ordered by `(priority, created_at)`.
///
/// The lease only becomes visible to other workers once the caller commits.
pub async fn claim_batch<'e, E: PgExecutor<'e>>(
    executor: E,
    limit: i64,
    worker_id: &str,
    lease_timeout: Duration,
) -> Result<Vec<Job>, sqlx::Error> {
    let query = format!(
        r#"
        WITH picked AS (
            SELECT id
            FROM jobs
            WHERE status = 'QUEUED'
              AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $3))
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        ),
        claimed AS (
            UPDATE jobs j
            SET locked_by = $2,
                locked_at = NOW(),
                attempts = j.attempts + 1
            FROM picked
            WHERE j.id = picked.id
            RETURNING j.*
        )
        SELECT {JOB_COLUMNS}
        FROM claimed
        ORDER BY priority ASC, created_at ASC, id ASC
        "#
    );

    let rows = sqlx::query(&query)
        .bind(limit)
        .bind(worker_id)
        .bind(lease_timeout.as_secs_f64())
        .fetch_all(executor)
        .await?;

    rows.iter().map(job_from_row).collect()
}

/// Detail rows of a job grouped by option type, in insertion order.
pub async fn fetch_details<'e, E: PgExecutor<'e>>(
    executor: E,
    job_id: i64,
) -> Result<JobDetails, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT opt_type::text AS opt_type, opt_key, opt_value
        FROM job_details
        WHERE job_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(executor)
    .await?;

    let mut details = JobDetails::default();
    for row in rows {
        let opt_type: String = row.try_get("opt_type")?;
        let opt_key: String = row.try_get("opt_key")?;
        let opt_value: String = row.try_get("opt_value")?;
        details.push(&opt_type, opt_key, opt_value);
    }
    Ok(details)
}

/// Result of the best-effort prompt detail write. Callers may ignore it.
#[derive(Debug)]
pub enum PromptDetailWrite {
    Saved,
    Skipped(sqlx::Error),
}

impl PromptDetailWrite {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved)
    }
}

/// Append a `prompt` detail recording what was sent for this job.
///
/// Runs inside a savepoint, so a failed insert (e.g. a schema whose
/// `option_type` enum has no `prompt` member) leaves the surrounding
/// transaction usable.
pub async fn record_prompt_detail(
    conn: &mut PgConnection,
    job_id: i64,
    prompt: &str,
) -> PromptDetailWrite {
    match insert_prompt_detail(conn, job_id, prompt).await {
        Ok(()) => PromptDetailWrite::Saved,
        Err(e) => {
            tracing::warn!(job_id, error = %e, "Prompt detail not recorded");
            PromptDetailWrite::Skipped(e)
        }
    }
}

async fn insert_prompt_detail(
    conn: &mut PgConnection,
    job_id: i64,
    prompt: &str,
) -> Result<(), sqlx::Error> {
    let mut savepoint = conn.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO job_details (job_id, opt_type, opt_key, opt_value)
        VALUES ($1, 'prompt'::option_type, 'prompt', $2)
        "#,
    )
    .bind(job_id)
    .bind(prompt)
    .execute(&mut *savepoint)
    .await;

    match inserted {
        Ok(_) => savepoint.commit().await,
        Err(e) => {
            savepoint.rollback().await?;
            Err(e)
        }
    }
}

/// Clear the lease on a job.
pub async fn release_lock<'e, E: PgExecutor<'e>>(executor: E, job_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET locked_by = NULL,
            locked_at = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .execute(executor)
    .await?;

    Ok(())
}

/// Store an error message on a job and clear its lease.
pub async fn record_error<'e, E: PgExecutor<'e>>(
    executor: E,
    job_id: i64,
    message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET error_msg = $2,
            locked_by = NULL,
            locked_at = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(message)
    .execute(executor)
    .await?;

    Ok(())
}

/// Move a job to COMPLETED with its output images and clear its lease.
pub async fn mark_completed<'e, E: PgExecutor<'e>>(
    executor: E,
    job_id: i64,
    output_urls: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'COMPLETED',
            output_urls = $2,
            error_msg = NULL,
            locked_by = NULL,
            locked_at = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(sqlx::types::Json(output_urls))
    .execute(executor)
    .await?;

    Ok(())
}

/// Dead-letter a job: it will never be claimed again.
pub async fn mark_failed<'e, E: PgExecutor<'e>>(executor: E, job_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'FAILED',
            locked_by = NULL,
            locked_at = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .execute(executor)
    .await?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job<'e, E: PgExecutor<'e>>(executor: E, job_id: i64) -> Result<Option<Job>, sqlx::Error> {
    let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
    let row = sqlx::query(&query)
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Number of jobs a worker could claim right now.
pub async fn queue_depth<'e, E: PgExecutor<'e>>(
    executor: E,
    lease_timeout: Duration,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS depth
        FROM jobs
        WHERE status = 'QUEUED'
          AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $1))
        "#,
    )
    .bind(lease_timeout.as_secs_f64())
    .fetch_one(executor)
    .await?;

    row.try_get("depth")
}
