//! Integration tests for the session workflow
//!
//! State gating, mapping ambiguity handling, mapping profiles, row edits,
//! validation and preview.

mod helpers;

use hcat_ingest::config::IngestSettings;
use hcat_ingest::models::{
    MappingOverride, MappingStatus, SessionConfig, SessionState, Severity, Transform,
};
use hcat_ingest::services::preview_builder::NodeStatus;
use hcat_ingest::IngestError;
use helpers::{config, csv, flat_csv, test_settings, TestEnv};

fn is_precondition<T: std::fmt::Debug>(result: Result<T, IngestError>) -> bool {
    matches!(result, Err(IngestError::Precondition(_)))
}

// ============================================================================
// Creation and gating
// ============================================================================

#[tokio::test]
async fn test_create_rejects_missing_title_and_unknown_standard() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;

    let result = sessions.create(config("   ")).await;
    assert!(matches!(result, Err(IngestError::InvalidInput(_))));

    let result = sessions
        .create(SessionConfig {
            standard: "marc21".to_string(),
            ..config("Unknown standard")
        })
        .await;
    assert!(matches!(result, Err(IngestError::InvalidInput(_))));

    let session = sessions.create(config("Box 12")).await.unwrap();
    assert_eq!(session.state, SessionState::Configuring);
    assert_eq!(sessions.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_steps_out_of_order_are_rejected() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = sessions.create(config("Gating")).await.unwrap();

    assert!(is_precondition(sessions.auto_map(session.id).await));
    assert!(is_precondition(sessions.validate(session.id, false).await));
    assert!(is_precondition(sessions.preview(session.id).await));
    assert!(is_precondition(sessions.create_job(session.id).await));

    sessions
        .upload(session.id, "batch.csv", None, &flat_csv(2))
        .await
        .unwrap();
    assert!(is_precondition(
        sessions.set_mapping(session.id, &[]).await
    ));
    assert!(is_precondition(sessions.validate(session.id, false).await));

    sessions.auto_map(session.id).await.unwrap();
    sessions.validate(session.id, false).await.unwrap();
    // Commit needs an approved preview
    assert!(is_precondition(sessions.create_job(session.id).await));

    sessions.preview(session.id).await.unwrap();
    let session = sessions.get(session.id).await.unwrap();
    assert_eq!(session.state, SessionState::Previewed);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let env = TestEnv::new().await;
    let result = env.pipeline.sessions.get(uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(IngestError::NotFound(_))));
}

#[tokio::test]
async fn test_upload_rejects_unknown_format_and_corrupt_payload() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = sessions.create(config("Formats")).await.unwrap();

    let result = sessions.upload(session.id, "batch.xlsx", None, b"PK..").await;
    assert!(matches!(result, Err(IngestError::Source(_))));

    let result = sessions
        .upload(session.id, "batch.csv", None, b"title,title\nA,B\n")
        .await;
    assert!(matches!(result, Err(IngestError::Source(_))));

    let session = sessions.get(session.id).await.unwrap();
    assert_eq!(session.state, SessionState::Configuring);
}

#[tokio::test]
async fn test_reupload_discards_mappings() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = env.validated_session(config("Re-upload"), &flat_csv(2)).await;
    assert_eq!(session.state, SessionState::Validated);

    let session = sessions
        .upload(session.id, "batch.csv", None, &flat_csv(4))
        .await
        .unwrap();

    assert_eq!(session.state, SessionState::Uploaded);
    assert_eq!(session.total_rows, 4);
    assert!(sessions.mappings(session.id).await.unwrap().is_empty());
    assert!(sessions.findings(session.id, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_only_before_commit() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;

    let session = env.previewed_session(config("Abandoned"), &flat_csv(1)).await;
    let session = sessions.cancel(session.id).await.unwrap();
    assert_eq!(session.state, SessionState::Cancelled);
    assert!(is_precondition(sessions.cancel(session.id).await));
    assert!(is_precondition(sessions.auto_map(session.id).await));

    let committed = env.previewed_session(config("Committed"), &flat_csv(1)).await;
    env.commit(committed.id).await;
    assert!(is_precondition(sessions.cancel(committed.id).await));
}

// ============================================================================
// Mapping
// ============================================================================

fn payload_with_unknown_column() -> Vec<u8> {
    b"legacyId,identifier,title,levelOfDescription,Zzqx notes\n\
A,REF-A,First,File,scribble\n"
        .to_vec()
}

#[tokio::test]
async fn test_unresolved_mapping_blocks_validation_until_accepted() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = sessions.create(config("Ambiguous")).await.unwrap();
    sessions
        .upload(session.id, "batch.csv", None, &payload_with_unknown_column())
        .await
        .unwrap();
    let mappings = sessions.auto_map(session.id).await.unwrap();
    let unknown = mappings
        .iter()
        .find(|m| m.source_column == "Zzqx notes")
        .unwrap();
    assert_eq!(unknown.status, MappingStatus::Unmapped);

    match sessions.validate(session.id, false).await {
        Err(IngestError::MappingAmbiguity { columns }) => {
            assert_eq!(columns, vec!["Zzqx notes".to_string()]);
        }
        other => panic!("expected mapping ambiguity, got {:?}", other),
    }
    assert_eq!(
        sessions.get(session.id).await.unwrap().state,
        SessionState::Mapped
    );

    sessions.validate(session.id, true).await.unwrap();
    let session = sessions.get(session.id).await.unwrap();
    assert_eq!(session.state, SessionState::Validated);
    assert!(session.accept_unresolved);
}

#[tokio::test]
async fn test_manual_override_resolves_and_survives_remap() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = sessions.create(config("Override")).await.unwrap();
    sessions
        .upload(session.id, "batch.csv", None, &payload_with_unknown_column())
        .await
        .unwrap();
    sessions.auto_map(session.id).await.unwrap();

    let mappings = sessions
        .set_mapping(
            session.id,
            &[MappingOverride {
                source_column: "Zzqx notes".to_string(),
                target_field: Some("scopeAndContent".to_string()),
                transform: None,
                default_value: None,
            }],
        )
        .await
        .unwrap();
    assert!(hcat_ingest::services::mapping_engine::unresolved_columns(&mappings).is_empty());

    let remapped = sessions.auto_map(session.id).await.unwrap();
    let notes = remapped
        .iter()
        .find(|m| m.source_column == "Zzqx notes")
        .unwrap();
    assert_eq!(notes.status, MappingStatus::Manual);
    assert_eq!(notes.target_field.as_deref(), Some("scopeAndContent"));

    sessions.validate(session.id, false).await.unwrap();
}

#[tokio::test]
async fn test_override_of_unknown_field_is_invalid_input() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = sessions.create(config("Bad override")).await.unwrap();
    sessions
        .upload(session.id, "batch.csv", None, &flat_csv(1))
        .await
        .unwrap();
    sessions.auto_map(session.id).await.unwrap();

    let result = sessions
        .set_mapping(
            session.id,
            &[MappingOverride {
                source_column: "title".to_string(),
                target_field: Some("notAField".to_string()),
                transform: None,
                default_value: None,
            }],
        )
        .await;
    assert!(matches!(result, Err(IngestError::InvalidInput(_))));
}

#[tokio::test]
async fn test_auto_map_is_deterministic() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = sessions.create(config("Deterministic")).await.unwrap();
    sessions
        .upload(session.id, "batch.csv", None, &payload_with_unknown_column())
        .await
        .unwrap();

    let first = sessions.auto_map(session.id).await.unwrap();
    let second = sessions.auto_map(session.id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(sessions.mappings(session.id).await.unwrap(), first);
}

#[tokio::test]
async fn test_mapping_profile_saved_and_replayed_on_new_session() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let first = sessions.create(config("Profile source")).await.unwrap();
    sessions
        .upload(first.id, "batch.csv", None, &payload_with_unknown_column())
        .await
        .unwrap();
    sessions.auto_map(first.id).await.unwrap();
    sessions
        .set_mapping(
            first.id,
            &[MappingOverride {
                source_column: "Zzqx notes".to_string(),
                target_field: Some("scopeAndContent".to_string()),
                transform: Some(Transform::Trim),
                default_value: None,
            }],
        )
        .await
        .unwrap();

    let saved = sessions
        .save_mapping_profile(first.id, "Parish registers")
        .await
        .unwrap();
    assert!(saved.entries.iter().any(|e| e.source_column == "Zzqx notes"));
    let resaved = sessions
        .save_mapping_profile(first.id, "Parish registers")
        .await
        .unwrap();
    assert_eq!(resaved.id, saved.id);
    sessions.save_mapping_profile(first.id, "Accessions").await.unwrap();
    let names: Vec<String> = sessions
        .list_mapping_profiles()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["Accessions", "Parish registers"]);

    let second = sessions.create(config("Profile target")).await.unwrap();
    let payload = b"legacyId,identifier,title,levelOfDescription,ZZQX NOTES\n\
B,REF-B,Second,File,more scribble\n"
        .to_vec();
    sessions
        .upload(second.id, "batch.csv", None, &payload)
        .await
        .unwrap();
    let before = sessions.auto_map(second.id).await.unwrap();
    assert!(!hcat_ingest::services::mapping_engine::unresolved_columns(&before).is_empty());

    let applied = sessions
        .apply_mapping_profile(second.id, saved.id)
        .await
        .unwrap();
    let notes = applied
        .iter()
        .find(|m| m.source_column == "ZZQX NOTES")
        .unwrap();
    assert_eq!(notes.status, MappingStatus::Manual);
    assert_eq!(notes.target_field.as_deref(), Some("scopeAndContent"));
    assert_eq!(notes.transform, Some(Transform::Trim));
    assert!(hcat_ingest::services::mapping_engine::unresolved_columns(&applied).is_empty());
    sessions.validate(second.id, false).await.unwrap();
}

#[tokio::test]
async fn test_mapping_profile_errors() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = sessions.create(config("Profiles")).await.unwrap();
    sessions
        .upload(session.id, "batch.csv", None, &flat_csv(1))
        .await
        .unwrap();

    // Nothing mapped yet
    assert!(is_precondition(
        sessions.save_mapping_profile(session.id, "Empty").await
    ));
    sessions.auto_map(session.id).await.unwrap();
    assert!(matches!(
        sessions.save_mapping_profile(session.id, "  ").await,
        Err(IngestError::InvalidInput(_))
    ));
    assert!(matches!(
        sessions
            .apply_mapping_profile(session.id, uuid::Uuid::new_v4())
            .await,
        Err(IngestError::NotFound(_))
    ));
}

// ============================================================================
// Row edits
// ============================================================================

#[tokio::test]
async fn test_fixed_and_excluded_rows_shape_the_commit() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let payload = csv(&[
        "A,,REF-A,First,File",
        "B,,REF-B,,File",
        "C,,REF-C,Third,File",
    ]);
    let session = env.validated_session(config("Row edits"), &payload).await;
    let errors = sessions
        .findings(session.id, Some(Severity::Error))
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].row_index, 2);

    let fixed = sessions
        .fix_row(session.id, 2, "title", " Second ")
        .await
        .unwrap();
    assert_eq!(fixed.fixes.get("title").map(String::as_str), Some("Second"));
    let edited = sessions.get(session.id).await.unwrap();
    assert_eq!(edited.state, SessionState::Mapped);
    assert!(sessions.findings(session.id, None).await.unwrap().is_empty());

    let excluded = sessions.exclude_row(session.id, 3, true).await.unwrap();
    assert!(excluded.excluded);

    let findings = sessions.validate(session.id, false).await.unwrap();
    assert!(findings.iter().all(|f| !f.is_error()));
    assert!(findings.iter().all(|f| f.row_index != 3));
    sessions.preview(session.id).await.unwrap();

    let job = env.commit(session.id).await;
    assert_eq!(job.total_rows, 2);
    assert_eq!(job.created_records, 2);
    assert_eq!(
        env.record_by_reference("B").await.unwrap().fields["title"],
        "Second"
    );
    assert!(env.record_by_reference("C").await.is_none());

    assert!(is_precondition(sessions.exclude_row(session.id, 1, true).await));
}

#[tokio::test]
async fn test_row_edit_errors() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = sessions.create(config("Row edit errors")).await.unwrap();
    sessions
        .upload(session.id, "batch.csv", None, &flat_csv(2))
        .await
        .unwrap();

    assert!(matches!(
        sessions.fix_row(session.id, 1, "notAField", "x").await,
        Err(IngestError::InvalidInput(_))
    ));
    assert!(matches!(
        sessions.exclude_row(session.id, 99, true).await,
        Err(IngestError::NotFound(_))
    ));

    // Edits before mapping keep the session in Uploaded
    sessions.exclude_row(session.id, 1, true).await.unwrap();
    assert_eq!(
        sessions.get(session.id).await.unwrap().state,
        SessionState::Uploaded
    );
    let restored = sessions.exclude_row(session.id, 1, false).await.unwrap();
    assert!(!restored.excluded);
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_validation_is_idempotent_and_ordered() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let payload = csv(&[
        "A,,REF-A,First,Fonds",
        "B,,,,Nonsense",
        "A,,REF-C,Duplicate key,File",
    ]);
    let session = env.validated_session(config("Findings"), &payload).await;

    let first = sessions.findings(session.id, None).await.unwrap();
    let again = sessions.validate(session.id, false).await.unwrap();
    assert_eq!(first, again);

    let rows: Vec<usize> = first.iter().map(|f| f.row_index).collect();
    let mut sorted = rows.clone();
    sorted.sort();
    assert_eq!(rows, sorted);

    let errors = sessions
        .findings(session.id, Some(Severity::Error))
        .await
        .unwrap();
    let codes: Vec<(usize, &str)> = errors.iter().map(|f| (f.row_index, f.code.as_str())).collect();
    assert!(codes.contains(&(2, "REQUIRED_MISSING")));
    assert!(codes.contains(&(3, "DUPLICATE_REFERENCE")));
    assert!(errors.iter().all(|f| f.row_index != 1));

    // Unknown vocabulary terms warn but do not block
    let warnings = sessions
        .findings(session.id, Some(Severity::Warning))
        .await
        .unwrap();
    assert!(warnings
        .iter()
        .any(|f| f.row_index == 2 && f.code == "VOCABULARY_UNKNOWN"));
}

// ============================================================================
// Preview
// ============================================================================

#[tokio::test]
async fn test_preview_builds_forest_with_orphans() {
    let env = TestEnv::new().await;
    let payload = csv(&[
        "A,,REF-A,Parent,Fonds",
        "B,A,REF-B,Child,File",
        "O,Z,REF-O,Orphan,File",
    ]);
    let session = env.validated_session(config("Forest"), &payload).await;

    let tree = env.pipeline.sessions.preview(session.id).await.unwrap();

    assert_eq!(tree.total_rows, 3);
    assert_eq!(tree.eligible_rows, 2);
    assert_eq!(tree.roots.len(), 1);
    assert_eq!(tree.roots[0].key.as_deref(), Some("A"));
    assert_eq!(tree.roots[0].children.len(), 1);
    assert_eq!(tree.roots[0].children[0].key.as_deref(), Some("B"));
    assert_eq!(tree.detached.len(), 1);
    assert_eq!(tree.detached[0].row_index, 3);
    assert_eq!(tree.detached[0].status, NodeStatus::Error);

    let findings = env.pipeline.sessions.findings(session.id, None).await.unwrap();
    assert!(findings
        .iter()
        .any(|f| f.row_index == 3 && f.code == "ORPHAN_PARENT"));
}

#[tokio::test]
async fn test_preview_reports_cycles() {
    let env = TestEnv::new().await;
    let payload = csv(&[
        "A,B,REF-A,Loop one,File",
        "B,A,REF-B,Loop two,File",
        "C,,REF-C,Fine,File",
    ]);
    let session = env.validated_session(config("Cycle"), &payload).await;
    let tree = env.pipeline.sessions.preview(session.id).await.unwrap();

    assert_eq!(tree.cyclic_rows, vec![1, 2]);
    assert_eq!(tree.roots.len(), 1);
    assert_eq!(tree.eligible_rows, 1);

    let errors = env
        .pipeline
        .sessions
        .findings(session.id, Some(Severity::Error))
        .await
        .unwrap();
    assert_eq!(
        errors.iter().filter(|f| f.code == "HIERARCHY_CYCLE").count(),
        2
    );
}

#[tokio::test]
async fn test_preview_caps_children_and_depth() {
    let env = TestEnv::with_settings(IngestSettings {
        preview_child_cap: 2,
        max_hierarchy_depth: 2,
        ..test_settings()
    })
    .await;
    let payload = csv(&[
        "A,,REF-A,Top,Fonds",
        "B1,A,REF-B1,First,Series",
        "B2,A,REF-B2,Second,Series",
        "B3,A,REF-B3,Third,Series",
        "C,B1,REF-C,Too deep,File",
    ]);
    let session = env.validated_session(config("Caps"), &payload).await;
    let tree = env.pipeline.sessions.preview(session.id).await.unwrap();

    let top = &tree.roots[0];
    assert_eq!(top.children.len(), 2);
    assert_eq!(top.hidden_children, 1);
    assert_eq!(top.children[0].hidden_children, 1);
    assert!(top.children[0].children.is_empty());

    let errors = env
        .pipeline
        .sessions
        .findings(session.id, Some(Severity::Error))
        .await
        .unwrap();
    assert!(errors
        .iter()
        .any(|f| f.row_index == 5 && f.code == "DEPTH_EXCEEDED"));
}

#[tokio::test]
async fn test_repeated_preview_is_read_only() {
    let env = TestEnv::new().await;
    let session = env.previewed_session(config("Twice"), &flat_csv(3)).await;
    assert_eq!(session.state, SessionState::Previewed);

    let tree = env.pipeline.sessions.preview(session.id).await.unwrap();
    assert_eq!(tree.roots.len(), 3);
    let session = env.pipeline.sessions.get(session.id).await.unwrap();
    assert_eq!(session.state, SessionState::Previewed);
}

// ============================================================================
// Re-commit and cleanup
// ============================================================================

#[tokio::test]
async fn test_recommit_requires_prior_jobs_rolled_back() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = env.previewed_session(config("Recommit"), &flat_csv(2)).await;

    let job = env.commit(session.id).await;
    assert!(is_precondition(sessions.create_job(session.id).await));

    env.pipeline.runner.rollback(job.id).await.unwrap();
    let session = sessions.get(session.id).await.unwrap();
    assert_eq!(session.state, SessionState::RolledBack);

    let again = env.commit(session.id).await;
    assert_eq!(again.created_records, 2);
    assert_eq!(sessions.jobs(session.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cleanup_deletes_only_terminal_sessions() {
    let env = TestEnv::with_settings(IngestSettings {
        session_retention_hours: 0,
        ..test_settings()
    })
    .await;
    let sessions = &env.pipeline.sessions;

    let done = env.previewed_session(config("Done"), &flat_csv(1)).await;
    env.commit(done.id).await;
    let open = env.validated_session(config("Open"), &flat_csv(1)).await;

    assert!(is_precondition(sessions.delete(open.id).await));

    let removed = sessions.cleanup_expired().await.unwrap();
    assert_eq!(removed, vec![done.id]);
    assert!(matches!(
        sessions.get(done.id).await,
        Err(IngestError::NotFound(_))
    ));
    assert!(sessions.get(open.id).await.is_ok());
}

#[tokio::test]
async fn test_delete_within_retention_window_is_rejected() {
    let env = TestEnv::new().await;
    let sessions = &env.pipeline.sessions;
    let session = sessions.create(config("Recent")).await.unwrap();
    let session = sessions.cancel(session.id).await.unwrap();

    assert!(is_precondition(sessions.delete(session.id).await));
}
