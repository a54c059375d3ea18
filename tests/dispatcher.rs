//! End-to-end dispatch behaviour with a scripted generator.

mod common;

use async_trait::async_trait;
use common::{age_lease, count_prompt_details, insert_detail, insert_job, settings, ScriptedGenerator};
use profile_photo_dispatcher::db::queries;
use profile_photo_dispatcher::models::job::JobStatus;
use profile_photo_dispatcher::services::dispatcher::{
    DispatchError, DispatchSettings, Dispatcher, JobOutcome, PollSummary,
};
use profile_photo_dispatcher::services::generation::{
    GenerationError, GenerationOutput, GenerationRequest, ImageGenerator,
};
use profile_photo_dispatcher::services::prompt::PromptTemplate;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn dispatcher(
    pool: &PgPool,
    generator: &ScriptedGenerator,
    settings: DispatchSettings,
) -> Dispatcher<ScriptedGenerator> {
    Dispatcher::new(
        pool.clone(),
        generator.clone(),
        PromptTemplate::standard().unwrap(),
        settings,
    )
}

#[sqlx::test(migrations = "./migrations")]
async fn failing_job_does_not_affect_siblings(pool: PgPool) {
    let first = insert_job(&pool, json!(["1.jpg"]), 1, 30.0).await;
    let second = insert_job(&pool, json!(["2.jpg"]), 1, 20.0).await;
    let third = insert_job(&pool, json!(["3.jpg"]), 1, 10.0).await;

    let generator = ScriptedGenerator::failing_for(&[second]);
    let summary = dispatcher(&pool, &generator, settings("w1"))
        .poll_once()
        .await
        .unwrap();

    assert_eq!(
        summary,
        PollSummary {
            claimed: 3,
            completed: 2,
            failed: 1,
            dead_lettered: 0,
            released: 0,
        }
    );

    for id in [first, third] {
        let job = queries::get_job(&pool, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.output_urls,
            Some(json!([format!("https://cdn.example.com/{id}/0.png")]))
        );
        assert_eq!(job.locked_by, None);
        assert_eq!(job.error_msg, None);
    }

    let failed = queries::get_job(&pool, second).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Queued);
    assert_eq!(failed.locked_by, None);
    assert_eq!(failed.locked_at, None);
    let error = failed.error_msg.unwrap();
    assert!(error.starts_with("worker error:"), "{error}");
    assert!(error.contains("provider exploded"), "{error}");
}

#[sqlx::test(migrations = "./migrations")]
async fn request_is_built_from_details_and_input_urls(pool: PgPool) {
    let id = insert_job(
        &pool,
        json!(["face.jpg", "prop1.jpg", "prop2.jpg", "prop3.jpg", "prop4.jpg"]),
        1,
        0.0,
    )
    .await;
    insert_detail(&pool, id, "shot_type", "shot_type", "upper_body").await;
    insert_detail(&pool, id, "expression", "expression", "smile").await;
    insert_detail(&pool, id, "background", "type", "monotone").await;
    insert_detail(&pool, id, "background", "color", "#FFFFFF").await;

    let generator = ScriptedGenerator::default();
    dispatcher(&pool, &generator, settings("w1"))
        .poll_once()
        .await
        .unwrap();

    let calls = generator.calls();
    assert_eq!(calls.len(), 1);
    let request = &calls[0];
    assert_eq!(request.job_id, id);
    assert_eq!(request.main_image, "face.jpg");
    assert_eq!(request.prop_images, vec!["prop1.jpg", "prop2.jpg", "prop3.jpg"]);
    assert!(request.prompt.contains("- Composition: upper body\n"));
    assert!(request.prompt.contains("- Expression: smile\n"));
    assert!(request.prompt.contains("- Lighting: studio light\n"));
    assert!(request.prompt.contains("- Mood/Feeling: professional\n"));
    assert!(request.prompt.contains("- Background: monotone (color: #FFFFFF)\n"));

    // The prompt that was sent is kept alongside the job's options.
    assert_eq!(count_prompt_details(&pool, id).await, 1);
    let details = queries::fetch_details(&pool, id).await.unwrap();
    assert_eq!(
        details.value(
            profile_photo_dispatcher::models::options::OptionType::Prompt,
            "prompt"
        ),
        Some(request.prompt.as_str())
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn serialized_input_urls_are_accepted(pool: PgPool) {
    let id = insert_job(&pool, json!(r#"["face.jpg", "hat.png"]"#), 1, 0.0).await;

    let generator = ScriptedGenerator::default();
    let summary = dispatcher(&pool, &generator, settings("w1"))
        .poll_once()
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    let calls = generator.calls();
    assert_eq!(calls[0].main_image, "face.jpg");
    assert_eq!(calls[0].prop_images, vec!["hat.png"]);

    let job = queries::get_job(&pool, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[sqlx::test(migrations = "./migrations")]
async fn missing_main_image_fails_before_calling_provider(pool: PgPool) {
    let id = insert_job(&pool, json!([]), 1, 0.0).await;

    let generator = ScriptedGenerator::default();
    let summary = dispatcher(&pool, &generator, settings("w1"))
        .poll_once()
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert!(generator.calls().is_empty());

    let job = queries::get_job(&pool, id).await.unwrap().unwrap();
    assert!(job.error_msg.unwrap().contains("No main image"));
    assert_eq!(job.locked_by, None);
}

#[sqlx::test(migrations = "./migrations")]
async fn malformed_input_urls_fail_only_that_job(pool: PgPool) {
    let bad = insert_job(&pool, json!({"face": "x.jpg"}), 1, 10.0).await;
    let good = insert_job(&pool, json!(["face.jpg"]), 1, 0.0).await;

    let generator = ScriptedGenerator::default();
    let summary = dispatcher(&pool, &generator, settings("w1"))
        .poll_once()
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);

    let job = queries::get_job(&pool, bad).await.unwrap().unwrap();
    assert!(job.error_msg.unwrap().contains("invalid input_urls"));
    let job = queries::get_job(&pool, good).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[sqlx::test(migrations = "./migrations")]
async fn repeated_failures_are_dead_lettered(pool: PgPool) {
    let id = insert_job(&pool, json!(["face.jpg"]), 1, 0.0).await;
    let generator = ScriptedGenerator::failing_for(&[id]);
    let dispatcher = dispatcher(
        &pool,
        &generator,
        DispatchSettings {
            max_attempts: 2,
            ..settings("w1")
        },
    );

    let first = dispatcher.poll_once().await.unwrap();
    assert_eq!((first.failed, first.dead_lettered), (1, 0));
    let job = queries::get_job(&pool, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 1);

    let second = dispatcher.poll_once().await.unwrap();
    assert_eq!((second.failed, second.dead_lettered), (1, 1));
    let job = queries::get_job(&pool, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert!(job.error_msg.is_some());

    assert_eq!(dispatcher.poll_once().await.unwrap().claimed, 0);
    assert_eq!(generator.calls_for(id), 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn unlimited_attempts_keep_job_queued(pool: PgPool) {
    let id = insert_job(&pool, json!(["face.jpg"]), 1, 0.0).await;
    let generator = ScriptedGenerator::failing_for(&[id]);
    let dispatcher = dispatcher(
        &pool,
        &generator,
        DispatchSettings {
            max_attempts: 0,
            ..settings("w1")
        },
    );

    for _ in 0..4 {
        let summary = dispatcher.poll_once().await.unwrap();
        assert_eq!(summary.dead_lettered, 0);
    }

    let job = queries::get_job(&pool, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 4);
}

/// Blocks inside `generate` until the test lets it go.
#[derive(Clone, Default)]
struct GatedGenerator {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl ImageGenerator for GatedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(GenerationOutput {
            output_urls: vec![format!("https://cdn.example.com/{}/slow.png", request.job_id)],
        })
    }
}

/// Requests shutdown from inside the first provider call.
struct CancellingGenerator {
    cancel: CancellationToken,
}

#[async_trait]
impl ImageGenerator for CancellingGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GenerationError> {
        self.cancel.cancel();
        Ok(GenerationOutput {
            output_urls: vec![format!("https://cdn.example.com/{}/0.png", request.job_id)],
        })
    }
}

#[sqlx::test(migrations = "./migrations")]
async fn expired_lease_is_reclaimed_while_first_worker_waits(pool: PgPool) {
    let id = insert_job(&pool, json!(["face.jpg"]), 1, 0.0).await;

    let gate = GatedGenerator::default();
    let slow = Arc::new(Dispatcher::new(
        pool.clone(),
        gate.clone(),
        PromptTemplate::standard().unwrap(),
        settings("slow"),
    ));
    let generator = ScriptedGenerator::default();
    let fast = dispatcher(&pool, &generator, settings("fast"));

    let claimed = slow.claim().await.unwrap();
    assert_eq!(claimed.len(), 1);
    let slow_task = tokio::spawn({
        let slow = slow.clone();
        let job = claimed[0].clone();
        async move { slow.process_job(&job).await }
    });

    // The slow worker is now parked inside the provider call, past its lease.
    tokio::time::timeout(Duration::from_secs(5), gate.entered.notified())
        .await
        .expect("slow worker never reached the provider");
    age_lease(&pool, id, 600.0).await;

    let summary = tokio::time::timeout(Duration::from_secs(5), fast.poll_once())
        .await
        .expect("reclaim blocked behind the slow worker")
        .unwrap();
    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(generator.calls_for(id), 1);

    gate.release.notify_one();
    let outcome = tokio::time::timeout(Duration::from_secs(5), slow_task)
        .await
        .expect("slow worker did not finish")
        .unwrap();
    assert!(matches!(outcome, JobOutcome::Completed { .. }));

    // Both workers processed the job; the later write wins.
    assert_eq!(count_prompt_details(&pool, id).await, 2);
    let job = queries::get_job(&pool, id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(
        job.output_urls,
        Some(json!([format!("https://cdn.example.com/{id}/slow.png")]))
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn shutdown_releases_rest_of_batch(pool: PgPool) {
    let first = insert_job(&pool, json!(["1.jpg"]), 1, 30.0).await;
    let second = insert_job(&pool, json!(["2.jpg"]), 1, 20.0).await;
    let third = insert_job(&pool, json!(["3.jpg"]), 1, 10.0).await;

    let cancel = CancellationToken::new();
    let cancelling = Dispatcher::new(
        pool.clone(),
        CancellingGenerator {
            cancel: cancel.clone(),
        },
        PromptTemplate::standard().unwrap(),
        settings("w1"),
    );

    let summary = cancelling.poll(&cancel).await.unwrap();
    assert_eq!(
        summary,
        PollSummary {
            claimed: 3,
            completed: 1,
            failed: 0,
            dead_lettered: 0,
            released: 2,
        }
    );

    let job = queries::get_job(&pool, first).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    for id in [second, third] {
        let job = queries::get_job(&pool, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.locked_by, None);
        assert_eq!(job.locked_at, None);
        assert_eq!(job.error_msg, None);
    }

    // Released jobs are immediately claimable by another worker.
    let generator = ScriptedGenerator::default();
    let other = dispatcher(&pool, &generator, settings("w2"));
    let claimed: Vec<i64> = other.claim().await.unwrap().iter().map(|j| j.id).collect();
    assert_eq!(claimed, vec![second, third]);
}

#[sqlx::test(migrations = "./migrations")]
async fn claim_failure_is_reported_not_fatal(pool: PgPool) {
    let generator = ScriptedGenerator::default();
    let dispatcher = Arc::new(dispatcher(&pool, &generator, settings("w1")));
    pool.close().await;

    assert!(matches!(
        dispatcher.poll_once().await,
        Err(DispatchError::Database(_))
    ));

    // The loop keeps polling through store errors until told to stop.
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        async move { dispatcher.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!task.is_finished());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
}

#[sqlx::test(migrations = "./migrations")]
async fn run_processes_jobs_until_cancelled(pool: PgPool) {
    let id = insert_job(&pool, json!(["face.jpg"]), 1, 0.0).await;
    let generator = ScriptedGenerator::default();
    let dispatcher = Arc::new(dispatcher(&pool, &generator, settings("w1")));

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        async move { dispatcher.run(cancel).await }
    });

    let mut status = JobStatus::Queued;
    for _ in 0..100 {
        status = queries::get_job(&pool, id).await.unwrap().unwrap().status;
        if status == JobStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, JobStatus::Completed);

    // A job submitted later is picked up by a subsequent poll.
    let later = insert_job(&pool, json!(["late.jpg"]), 1, 0.0).await;
    for _ in 0..100 {
        if generator.calls_for(later) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(generator.calls_for(later), 1);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
    assert_eq!(generator.calls_for(id), 1);
}
