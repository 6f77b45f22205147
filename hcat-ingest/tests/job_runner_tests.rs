//! Integration tests for the job runner and task queues
//!
//! Single-flight start, cancellation, restart recovery and dispatch.

mod helpers;

use hcat_common::events::IngestEvent;
use hcat_ingest::models::{JobStatus, ManifestEntryState, SessionState};
use hcat_ingest::services::{ClaimOutcome, InlineQueue, StartOutcome, TaskQueue, WorkerQueue};
use hcat_ingest::IngestError;
use helpers::{config, flat_csv, TestEnv};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Single-flight start
// ============================================================================

#[tokio::test]
async fn test_concurrent_claims_admit_exactly_one() {
    let env = TestEnv::new().await;
    let session = env.previewed_session(config("Race"), &flat_csv(2)).await;
    let job = env.pipeline.sessions.create_job(session.id).await.unwrap();

    let runner = &env.pipeline.runner;
    let (first, second) = tokio::join!(runner.claim(job.id), runner.claim(job.id));
    let outcomes = [first.unwrap(), second.unwrap()];

    let claimed = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
        .count();
    let rejected = outcomes
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::AlreadyRunning))
        .count();
    assert_eq!(claimed, 1);
    assert_eq!(rejected, 1);
    assert_eq!(runner.status(job.id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_run_of_running_job_reports_already_running() {
    let env = TestEnv::new().await;
    let session = env.previewed_session(config("Held"), &flat_csv(1)).await;
    let job = env.pipeline.sessions.create_job(session.id).await.unwrap();

    let runner = &env.pipeline.runner;
    assert!(matches!(
        runner.claim(job.id).await.unwrap(),
        ClaimOutcome::Claimed(_)
    ));
    assert!(matches!(
        runner.run(job.id).await.unwrap(),
        StartOutcome::AlreadyRunning
    ));
    // Nothing was committed by the rejected start
    assert_eq!(env.catalog.record_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_finished_job_cannot_start_again() {
    let env = TestEnv::new().await;
    let session = env.previewed_session(config("Done"), &flat_csv(1)).await;
    let job = env.commit(session.id).await;

    let result = env.pipeline.runner.run(job.id).await;
    assert!(matches!(result, Err(IngestError::Precondition(_))));
}

#[tokio::test]
async fn test_duplicate_delivery_commits_once() {
    let env = TestEnv::new().await;
    let session = env.previewed_session(config("Twice"), &flat_csv(2)).await;
    let job = env.pipeline.sessions.create_job(session.id).await.unwrap();

    let queue = InlineQueue::new(env.pipeline.runner.clone());
    queue.enqueue(job.id).await.unwrap();
    queue.enqueue(job.id).await.unwrap();

    let job = env.pipeline.runner.status(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.created_records, 2);
    assert_eq!(env.catalog.record_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let env = TestEnv::new().await;
    let result = env.pipeline.runner.status(uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(IngestError::NotFound(_))));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_queued_job() {
    let env = TestEnv::new().await;
    let session = env.previewed_session(config("Never started"), &flat_csv(2)).await;
    let job = env.pipeline.sessions.create_job(session.id).await.unwrap();

    let job = env.pipeline.runner.cancel(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(
        env.pipeline.sessions.get(session.id).await.unwrap().state,
        SessionState::Completed
    );

    assert!(matches!(
        env.pipeline.runner.run(job.id).await,
        Err(IngestError::Precondition(_))
    ));
    assert!(matches!(
        env.pipeline.runner.cancel(job.id).await,
        Err(IngestError::Precondition(_))
    ));
    assert_eq!(env.catalog.record_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_mid_commit_keeps_manifest_complete() {
    let env = TestEnv::cancelling("R2").await;
    let session = env.previewed_session(config("Interrupted"), &flat_csv(4)).await;

    let job = env.commit(session.id).await;

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.processed_rows, 2);
    assert_eq!(job.created_records, 2);
    assert_eq!(env.catalog.record_count().await.unwrap(), 2);
    assert_eq!(
        env.pipeline.sessions.get(session.id).await.unwrap().state,
        SessionState::Completed
    );

    // Every record the job created is manifested and committed
    let manifest = env.pipeline.runner.manifest(job.id).await.unwrap();
    assert_eq!(manifest.status, "cancelled");
    assert_eq!(manifest.entries.len(), 2);
    assert!(manifest
        .entries
        .iter()
        .all(|e| e.state == ManifestEntryState::Committed));

    let report = env.pipeline.runner.rollback(job.id).await.unwrap();
    assert_eq!(report.reverted_records, 2);
    assert_eq!(report.status, JobStatus::RolledBack);
    assert_eq!(env.catalog.record_count().await.unwrap(), 0);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_recover_interrupted_marks_running_jobs_failed() {
    let env = TestEnv::new().await;
    let session = env.previewed_session(config("Crashed"), &flat_csv(1)).await;
    let job = env.pipeline.sessions.create_job(session.id).await.unwrap();
    env.pipeline.runner.claim(job.id).await.unwrap();

    let recovered = env.pipeline.runner.recover_interrupted().await.unwrap();
    assert_eq!(recovered, 1);

    let job = env.pipeline.runner.status(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.completed_at.is_some());
    assert_eq!(
        env.pipeline.sessions.get(session.id).await.unwrap().state,
        SessionState::Failed
    );

    // A failed session may be committed again
    let retry = env.commit(session.id).await;
    assert_eq!(retry.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_queued_jobs_listed_for_redispatch() {
    let env = TestEnv::new().await;
    let first = env.previewed_session(config("One"), &flat_csv(1)).await;
    let second = env.previewed_session(config("Two"), &flat_csv(1)).await;
    let a = env.pipeline.sessions.create_job(first.id).await.unwrap();
    let b = env.pipeline.sessions.create_job(second.id).await.unwrap();
    env.pipeline.runner.run(a.id).await.unwrap();

    let queued = env.pipeline.runner.queued_jobs().await.unwrap();
    assert_eq!(queued, vec![b.id]);
}

// ============================================================================
// Worker pool and events
// ============================================================================

#[tokio::test]
async fn test_worker_queue_runs_job_and_emits_lifecycle() {
    let env = TestEnv::new().await;
    let session = env.previewed_session(config("Pooled"), &flat_csv(3)).await;
    let mut events = env.event_bus.subscribe();

    let shutdown = CancellationToken::new();
    let queue = WorkerQueue::start(env.pipeline.runner.clone(), 2, shutdown.clone());
    let job = env.pipeline.sessions.create_job(session.id).await.unwrap();
    queue.enqueue(job.id).await.unwrap();

    let mut seen = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            seen.push(event.event_type());
            if let IngestEvent::JobFinished {
                status,
                created_records,
                ..
            } = event
            {
                return (status, created_records);
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(finished, ("completed".to_string(), 3));
    assert!(seen.contains(&"JobQueued"));
    assert!(seen.contains(&"JobStarted"));
    assert_eq!(seen.iter().filter(|t| **t == "JobProgress").count(), 3);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), queue.join())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_row_failures_are_broadcast() {
    let env = TestEnv::new().await;
    let payload = helpers::csv(&["A,,REF-A,Kept,File", "B,,REF-B,,File"]);
    let session = env.previewed_session(config("Events"), &payload).await;
    let mut events = env.event_bus.subscribe();

    let job = env.commit(session.id).await;

    let mut failed_rows = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let IngestEvent::RowFailed { job_id, row_index, stage, .. } = event {
            assert_eq!(job_id, job.id);
            assert_eq!(stage, "validation");
            failed_rows.push(row_index);
        }
    }
    assert_eq!(failed_rows, vec![2]);
}

#[tokio::test]
async fn test_tokens_released_after_run() {
    let env = TestEnv::new().await;
    let session = env.previewed_session(config("Tokens"), &flat_csv(1)).await;
    let runner = Arc::clone(&env.pipeline.runner);
    let job = env.pipeline.sessions.create_job(session.id).await.unwrap();
    runner.run(job.id).await.unwrap();

    assert!(env.pipeline.cancellation_tokens.read().await.is_empty());
}
