//! The polling loop that turns QUEUED jobs into generated photos.
//!
//! Each poll claims a batch in its own short transaction, then drives every
//! claimed job through prompt building and the provider call. Per job, the
//! detail read and prompt write commit before the provider is called and the
//! outcome is written afterwards in a second transaction, so no row lock is
//! held while waiting on the provider. A failing job records its error and
//! never affects its siblings; a failing poll is logged and retried after
//! the interval.
//!
//! Delivery is at-least-once. A worker that stalls past the lease timeout
//! can have its job reclaimed and processed a second time elsewhere while
//! it is still waiting, and both workers will write their outcome.

use sqlx::PgPool;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::db::queries::{self, PromptDetailWrite};
use crate::models::job::{InputUrls, InputUrlsError, Job};
use crate::models::options::StyleOptions;
use crate::services::generation::{GenerationError, GenerationRequest, ImageGenerator};
use crate::services::prompt::{self, PromptTemplate};

/// Loop parameters. See `AppConfig::dispatch_settings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub worker_id: String,
    pub batch_size: i64,
    pub lease_timeout: Duration,
    pub poll_interval: Duration,
    /// Claims after which a failing job is dead-lettered; 0 disables.
    pub max_attempts: i32,
}

impl DispatchSettings {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            batch_size: 5,
            lease_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

/// Counts for one poll cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Claimed but handed back unprocessed because of shutdown.
    pub released: usize,
}

/// What happened to a single claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { output_urls: Vec<String> },
    Failed { error: String, dead_lettered: bool },
}

pub struct Dispatcher<G> {
    pool: PgPool,
    generator: G,
    template: PromptTemplate,
    settings: DispatchSettings,
}

impl<G: ImageGenerator> Dispatcher<G> {
    pub fn new(pool: PgPool, generator: G, template: PromptTemplate, settings: DispatchSettings) -> Self {
        Self {
            pool,
            generator,
            template,
            settings,
        }
    }

    /// Poll until `cancel` fires. The job in progress is finished; the rest
    /// of its batch is released for other workers.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            worker_id = %self.settings.worker_id,
            batch_size = self.settings.batch_size,
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            lease_timeout_secs = self.settings.lease_timeout.as_secs(),
            "Dispatcher started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.poll(&cancel).await {
                Ok(summary) if summary.claimed > 0 => {
                    tracing::info!(
                        claimed = summary.claimed,
                        completed = summary.completed,
                        failed = summary.failed,
                        dead_lettered = summary.dead_lettered,
                        released = summary.released,
                        "Batch processed"
                    );
                }
                Ok(_) => tracing::trace!("No jobs available"),
                Err(e) => {
                    metrics::counter!("dispatcher_poll_errors_total").increment(1);
                    tracing::error!(error = %e, "Poll cycle failed, will retry");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        tracing::info!(worker_id = %self.settings.worker_id, "Dispatcher stopped");
    }

    /// One iteration: claim a batch, then process each job in turn.
    pub async fn poll_once(&self) -> Result<PollSummary, DispatchError> {
        self.poll(&CancellationToken::new()).await
    }

    /// Like [`poll_once`](Self::poll_once), but stops after the current job
    /// once `cancel` fires and hands the unprocessed leases back.
    ///
    /// Only a failed claim is returned as an error; per-job failures are
    /// recorded on the job and counted in the summary.
    pub async fn poll(&self, cancel: &CancellationToken) -> Result<PollSummary, DispatchError> {
        let jobs = self.claim().await?;

        let mut summary = PollSummary {
            claimed: jobs.len(),
            ..Default::default()
        };

        for (index, job) in jobs.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.released = self.release_unprocessed(&jobs[index..]).await;
                break;
            }

            match self.process_job(job).await {
                JobOutcome::Completed { .. } => summary.completed += 1,
                JobOutcome::Failed { dead_lettered, .. } => {
                    summary.failed += 1;
                    if dead_lettered {
                        summary.dead_lettered += 1;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Claim a batch and commit the leases before any job work starts.
    pub async fn claim(&self) -> Result<Vec<Job>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let jobs = queries::claim_batch(
            &mut *tx,
            self.settings.batch_size,
            &self.settings.worker_id,
            self.settings.lease_timeout,
        )
        .await?;
        tx.commit().await?;

        if !jobs.is_empty() {
            metrics::counter!("dispatcher_jobs_claimed_total").increment(jobs.len() as u64);
            tracing::debug!(
                worker_id = %self.settings.worker_id,
                job_ids = ?jobs.iter().map(|j| j.id).collect::<Vec<_>>(),
                "Claimed jobs"
            );
        }

        Ok(jobs)
    }

    /// Drive one claimed job to a recorded outcome. Never fails.
    pub async fn process_job(&self, job: &Job) -> JobOutcome {
        match self.try_process(job).await {
            Ok(output_urls) => {
                metrics::counter!("dispatcher_jobs_completed_total").increment(1);
                tracing::info!(
                    job_id = job.id,
                    attempt = job.attempts,
                    outputs = output_urls.len(),
                    "Job completed"
                );
                JobOutcome::Completed { output_urls }
            }
            Err(e) => {
                let error = format!("worker error: {e}");
                let dead_lettered =
                    self.settings.max_attempts > 0 && job.attempts >= self.settings.max_attempts;

                if let Err(store_err) = self.record_failure(job.id, &error, dead_lettered).await {
                    // Lease stays in place and expires on its own.
                    tracing::error!(
                        job_id = job.id,
                        error = %store_err,
                        "Failed to record job error"
                    );
                }

                metrics::counter!(
                    "dispatcher_jobs_failed_total",
                    "dead_lettered" => dead_lettered.to_string()
                )
                .increment(1);
                tracing::warn!(
                    job_id = job.id,
                    attempt = job.attempts,
                    dead_lettered,
                    error = %e,
                    "Job failed"
                );

                JobOutcome::Failed {
                    error,
                    dead_lettered,
                }
            }
        }
    }

    async fn try_process(&self, job: &Job) -> Result<Vec<String>, DispatchError> {
        let prompt = self.prepare_prompt(job.id).await?;

        let input_urls = InputUrls::from_json(&job.input_urls)?;
        let request = GenerationRequest::new(job.id, prompt, &input_urls)?;

        let started = Instant::now();
        let output = self.generator.generate(&request).await?;
        metrics::histogram!("dispatcher_generation_seconds").record(started.elapsed().as_secs_f64());

        let mut tx = self.pool.begin().await?;
        queries::mark_completed(&mut *tx, job.id, &output.output_urls).await?;
        tx.commit().await?;

        Ok(output.output_urls)
    }

    /// Read the job's options and record the prompt built from them.
    ///
    /// Committed before the provider call: the `job_details` insert holds a
    /// key-share lock on the job row, which would hide the row from other
    /// workers' claims until the transaction ends.
    async fn prepare_prompt(&self, job_id: i64) -> Result<String, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let details = queries::fetch_details(&mut *tx, job_id).await?;
        let options = StyleOptions::from_details(&details);
        let prompt = prompt::build_prompt(&self.template, &options);

        if let PromptDetailWrite::Skipped(_) =
            queries::record_prompt_detail(&mut *tx, job_id, &prompt).await
        {
            tracing::debug!(job_id, "Continuing without prompt detail");
        }

        tx.commit().await?;
        Ok(prompt)
    }

    /// Clear the leases of jobs left over at shutdown. Returns how many were
    /// released; a failed release is left to lease expiry.
    async fn release_unprocessed(&self, jobs: &[Job]) -> usize {
        let mut released = 0;
        for job in jobs {
            match self.release(job.id).await {
                Ok(()) => released += 1,
                Err(e) => tracing::warn!(job_id = job.id, error = %e, "Failed to release lease"),
            }
        }

        if released > 0 {
            tracing::info!(released, "Released unprocessed jobs on shutdown");
        }
        released
    }

    async fn release(&self, job_id: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        queries::release_lock(&mut *tx, job_id).await?;
        tx.commit().await
    }

    /// Written in its own transaction, independent of whichever step failed.
    async fn record_failure(&self, job_id: i64, error: &str, dead_lettered: bool) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        queries::record_error(&mut *tx, job_id, error).await?;
        if dead_lettered {
            queries::mark_failed(&mut *tx, job_id).await?;
        }
        tx.commit().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid input_urls: {0}")]
    InputUrls(#[from] InputUrlsError),

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),
}
