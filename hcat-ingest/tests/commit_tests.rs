//! Integration tests for the commit executor
//!
//! Dependency ordering, manifest contents, per-row failure handling, asset
//! import and fatal abort.

mod helpers;

use hcat_ingest::capabilities::CatalogError;
use hcat_ingest::models::{
    CommitStage, JobStatus, ManifestAction, ManifestEntryState, SessionConfig, SessionState,
    Severity,
};
use helpers::{config, csv, flat_csv, FailingEnrichment, TestEnv};
use std::sync::atomic::Ordering;
use std::sync::Arc;

// ============================================================================
// Row outcomes
// ============================================================================

#[tokio::test]
async fn test_row_missing_required_field_is_skipped() {
    let env = TestEnv::new().await;
    let payload = csv(&[
        "A,,REF-1,First,File",
        "B,,REF-2,,File",
        "C,,REF-3,Third,File",
    ]);
    let session = env.previewed_session(config("Three rows"), &payload).await;

    let errors = env
        .pipeline
        .sessions
        .findings(session.id, Some(hcat_ingest::models::Severity::Error))
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].row_index, 2);
    assert_eq!(errors[0].field_id.as_deref(), Some("title"));

    let job = env.commit(session.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outcome(), "completed_with_errors");
    assert_eq!(job.created_records, 2);
    assert_eq!(job.error_count, 1);
    assert_eq!(job.processed_rows, 3);
    assert_eq!(job.error_log[0].row_index, Some(2));
    assert_eq!(job.error_log[0].stage, CommitStage::Validation);
    assert_eq!(env.catalog.record_count().await.unwrap(), 2);

    let session = env.pipeline.sessions.get(session.id).await.unwrap();
    assert_eq!(session.state, SessionState::Completed);
}

#[tokio::test]
async fn test_parent_committed_before_child() {
    let env = TestEnv::new().await;
    // Child listed first; commit order must still put the parent first
    let payload = csv(&["B,A,REF-B,Child,File", "A,,REF-A,Parent,Fonds"]);
    let session = env.previewed_session(config("Parent and child"), &payload).await;

    let job = env.commit(session.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error_count, 0);

    let parent = env.record_by_reference("A").await.unwrap();
    let child = env.record_by_reference("B").await.unwrap();
    assert_eq!(parent.parent_id, None);
    assert_eq!(child.parent_id, Some(parent.id));

    let manifest = env.pipeline.runner.manifest(job.id).await.unwrap();
    let records: Vec<_> = manifest.entries.iter().map(|e| e.record_id).collect();
    assert_eq!(records, vec![parent.id, child.id]);
    assert_eq!(manifest.entries[0].seq, 1);
    assert_eq!(manifest.entries[1].parent_record_id, Some(parent.id));
    assert!(manifest
        .entries
        .iter()
        .all(|e| e.state == ManifestEntryState::Committed && e.action == ManifestAction::Created));
}

#[tokio::test]
async fn test_orphan_row_is_skipped_and_siblings_commit() {
    let env = TestEnv::new().await;
    let payload = csv(&["A,,REF-A,Kept,File", "B,C,REF-B,Orphan,File"]);
    let session = env.previewed_session(config("Orphan"), &payload).await;

    let job = env.commit(session.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.created_records, 1);
    assert_eq!(job.error_count, 1);
    assert_eq!(job.error_log[0].row_index, Some(2));
    assert!(env.record_by_reference("A").await.is_some());
    assert!(env.record_by_reference("B").await.is_none());
}

#[tokio::test]
async fn test_failed_parent_makes_child_dependency_unresolved() {
    let (env, catalog) = TestEnv::failing().await;
    catalog.fail_create("A", CatalogError::ConstraintViolation("rejected".to_string()));

    let payload = csv(&[
        "A,,REF-A,Parent,Fonds",
        "B,A,REF-B,Child,File",
        "C,,REF-C,Unrelated,File",
    ]);
    let session = env.previewed_session(config("Broken parent"), &payload).await;

    let job = env.commit(session.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.created_records, 1);
    assert_eq!(job.error_count, 2);
    let stages: Vec<_> = job.error_log.iter().map(|e| (e.row_index, e.stage)).collect();
    assert_eq!(
        stages,
        vec![
            (Some(1), CommitStage::RecordCreate),
            (Some(2), CommitStage::DependencyUnresolved),
        ]
    );

    // The failed create leaves its write-ahead entry reverted, not live
    let manifest = env.pipeline.runner.manifest(job.id).await.unwrap();
    assert_eq!(manifest.entries.len(), 2);
    assert_eq!(manifest.entries[0].state, ManifestEntryState::Reverted);
    assert_eq!(manifest.entries[1].state, ManifestEntryState::Committed);
}

#[tokio::test]
async fn test_catalog_outage_aborts_job() {
    let (env, catalog) = TestEnv::failing().await;
    catalog.fail_create("R2", CatalogError::Unavailable("connection reset".to_string()));

    let session = env.previewed_session(config("Outage"), &flat_csv(3)).await;
    let job = env.commit(session.id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.created_records, 1);
    assert_eq!(job.processed_rows, 1);
    let last = job.error_log.last().unwrap();
    assert_eq!(last.stage, CommitStage::Fatal);
    assert_eq!(last.row_index, None);

    // Row 3 was never attempted
    assert!(env.record_by_reference("R3").await.is_none());
    assert_eq!(env.catalog.record_count().await.unwrap(), 1);

    let session = env.pipeline.sessions.get(session.id).await.unwrap();
    assert_eq!(session.state, SessionState::Failed);

    // The row in flight stays live in the manifest for rollback
    let manifest = env.pipeline.runner.manifest(job.id).await.unwrap();
    assert_eq!(manifest.entries.len(), 2);
    assert_eq!(manifest.entries[1].state, ManifestEntryState::Pending);
}

#[tokio::test]
async fn test_enrichment_failure_does_not_fail_rows() {
    let enrichment = Arc::new(FailingEnrichment::default());
    let env = TestEnv::with_enrichment(enrichment.clone()).await;
    let session = env
        .previewed_session(
            SessionConfig {
                enrich: true,
                ..config("Enriched")
            },
            &flat_csv(2),
        )
        .await;

    let job = env.commit(session.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error_count, 0);
    assert_eq!(job.created_records, 2);

    for _ in 0..50 {
        if enrichment.calls.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(enrichment.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_top_level_rows_placed_under_configured_parent() {
    let env = TestEnv::new().await;
    let holding = env.previewed_session(config("Holding"), &flat_csv(1)).await;
    env.commit(holding.id).await;
    let holder = env.record_by_reference("R1").await.unwrap();

    let payload = csv(&["X,,REF-X,Placed,File"]);
    let session = env
        .previewed_session(
            SessionConfig {
                parent_record_id: Some(holder.id),
                ..config("Placed")
            },
            &payload,
        )
        .await;
    env.commit(session.id).await;

    let placed = env.record_by_reference("X").await.unwrap();
    assert_eq!(placed.parent_id, Some(holder.id));
}

// ============================================================================
// Assets
// ============================================================================

#[tokio::test]
async fn test_assets_stored_linked_and_manifested() {
    let env = TestEnv::new().await;
    let source_dir = env.temp_dir.path().join("source");
    std::fs::create_dir_all(&source_dir).unwrap();
    std::fs::write(source_dir.join("scan1.jpg"), b"jpeg bytes").unwrap();
    std::fs::write(source_dir.join("scan2.jpg"), b"more jpeg bytes").unwrap();

    let payload = b"legacyId,identifier,title,levelOfDescription,digitalObjectPath\n\
A,REF-A,Scanned,Item,scan1.jpg|scan2.jpg\n"
        .to_vec();
    let session = env
        .previewed_session(
            SessionConfig {
                asset_root: Some(source_dir),
                ..config("Assets")
            },
            &payload,
        )
        .await;

    let job = env.commit(session.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error_count, 0);
    assert_eq!(job.created_assets, 2);
    assert_eq!(env.catalog.asset_count().await.unwrap(), 2);

    let manifest = env.pipeline.runner.manifest(job.id).await.unwrap();
    let entry = &manifest.entries[0];
    assert_eq!(entry.assets.len(), 2);
    assert_eq!(
        entry.assets[0].checksum,
        hcat_ingest::capabilities::asset_fs::sha256_hex(b"jpeg bytes")
    );
    assert!(env.asset_dir.join(&entry.assets[1].path).is_file());

    let linked = env.catalog.assets_of(entry.record_id).await.unwrap();
    assert_eq!(linked.len(), 2);
}

#[tokio::test]
async fn test_missing_asset_is_skipped_at_commit() {
    let env = TestEnv::new().await;
    let source_dir = env.temp_dir.path().join("source");
    std::fs::create_dir_all(&source_dir).unwrap();
    std::fs::write(source_dir.join("present.tif"), b"tiff bytes").unwrap();

    let payload = b"legacyId,identifier,title,levelOfDescription,digitalObjectPath\n\
A,REF-A,No scan,Item,missing.tif|present.tif\n\
B,REF-B,Plain,Item,\n"
        .to_vec();
    let session = env
        .previewed_session(
            SessionConfig {
                asset_root: Some(source_dir),
                ..config("Missing asset")
            },
            &payload,
        )
        .await;

    let findings = env.pipeline.sessions.findings(session.id, None).await.unwrap();
    let missing = findings
        .iter()
        .find(|f| f.row_index == 1 && f.code == "ASSET_NOT_FOUND")
        .expect("missing asset reported");
    assert_eq!(missing.severity, Severity::Warning);

    let job = env.commit(session.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.created_records, 2);
    assert_eq!(job.error_count, 0);
    assert_eq!(job.created_assets, 1);
    let record = env.record_by_reference("A").await.expect("row A committed");
    assert_eq!(env.catalog.assets_of(record.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_asset_outside_root_blocks_row() {
    let env = TestEnv::new().await;
    let source_dir = env.temp_dir.path().join("source");
    std::fs::create_dir_all(&source_dir).unwrap();

    let payload = b"legacyId,identifier,title,levelOfDescription,digitalObjectPath\n\
A,REF-A,Escapes,Item,/etc/passwd\n\
B,REF-B,Plain,Item,\n"
        .to_vec();
    let session = env
        .previewed_session(
            SessionConfig {
                asset_root: Some(source_dir),
                ..config("Rejected asset")
            },
            &payload,
        )
        .await;

    let errors = env
        .pipeline
        .sessions
        .findings(session.id, Some(Severity::Error))
        .await
        .unwrap();
    assert!(errors
        .iter()
        .any(|f| f.row_index == 1 && f.code == "ASSET_PATH_REJECTED"));

    let job = env.commit(session.id).await;
    assert_eq!(job.created_records, 1);
    assert_eq!(job.created_assets, 0);
    assert!(env.record_by_reference("A").await.is_none());
}

// ============================================================================
// Manifest export
// ============================================================================

#[tokio::test]
async fn test_manifest_exported_on_finish() {
    let env = TestEnv::new().await;
    let session = env.previewed_session(config("Export"), &flat_csv(2)).await;
    let job = env.commit(session.id).await;

    let path = job.manifest_ref.clone().unwrap();
    assert!(path.ends_with(&format!("manifest_{}_{}.json", session.id, job.id)));

    let text = std::fs::read_to_string(&path).unwrap();
    let document: hcat_ingest::models::ManifestDocument = serde_json::from_str(&text).unwrap();
    assert_eq!(document.job_id, job.id);
    assert_eq!(document.status, "completed");
    assert_eq!(document.entries.len(), 2);
}

#[tokio::test]
async fn test_update_existing_records_previous_fields() {
    let env = TestEnv::new().await;
    let first = env.previewed_session(config("First load"), &flat_csv(1)).await;
    env.commit(first.id).await;
    let original = env.record_by_reference("R1").await.unwrap();

    let payload = csv(&["R1,,REF-1,Retitled,File"]);
    let second = env
        .previewed_session(
            SessionConfig {
                update_existing: true,
                ..config("Reload")
            },
            &payload,
        )
        .await;
    let job = env.commit(second.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.created_records, 0);
    let updated = env.record_by_reference("R1").await.unwrap();
    assert_eq!(updated.id, original.id);
    assert_eq!(updated.fields.get("title").map(String::as_str), Some("Retitled"));

    let manifest = env.pipeline.runner.manifest(job.id).await.unwrap();
    match &manifest.entries[0].action {
        ManifestAction::Updated { previous } => {
            assert_eq!(previous.get("title").map(String::as_str), Some("Record 1"));
        }
        other => panic!("expected update entry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_existing_reference_without_update_is_row_error() {
    let env = TestEnv::new().await;
    let first = env.previewed_session(config("First load"), &flat_csv(1)).await;
    env.commit(first.id).await;

    let second = env.previewed_session(config("Duplicate load"), &flat_csv(1)).await;
    let job = env.commit(second.id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.created_records, 0);
    assert_eq!(job.error_count, 1);
    assert_eq!(job.error_log[0].stage, CommitStage::RecordCreate);
    assert_eq!(env.catalog.record_count().await.unwrap(), 1);
}
