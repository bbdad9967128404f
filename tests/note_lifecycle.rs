use doc_notes_lib::boundary::UNEXPECTED_ERROR_MESSAGE;
use doc_notes_lib::config::{AppConfig, DownloadPolicy};
use doc_notes_lib::identity::SessionRegistry;
use doc_notes_lib::models::{
    CallerIdentity, CallerRole, CreateNotePayload, HistoryAction, ListHistoryFilters, ListPatientsFilters, NewDoctor,
    NewPatient, UpdateNotePayload,
};
use doc_notes_lib::service::ClinicCore;
use doc_notes_lib::ClinicApi;
use std::sync::Arc;

struct Clinic {
    _dir: tempfile::TempDir,
    api: ClinicApi,
    sessions: SessionRegistry,
    alice_id: i64,
    bob_id: i64,
}

/// Two doctors who share patient Alice; only the first cares for Bob.
fn clinic(config: impl FnOnce(&mut AppConfig)) -> Clinic {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = AppConfig::with_data_dir(dir.path());
    config(&mut settings);
    let core = ClinicCore::open(settings).expect("open core");
    let db = core.database().clone();

    let house = db
        .insert_doctor(&NewDoctor {
            full_name: "Dr. House".to_string(),
            user_id: Some("house@clinic.test".to_string()),
            ..NewDoctor::default()
        })
        .expect("house");
    let wilson = db
        .insert_doctor(&NewDoctor {
            full_name: "Dr. Wilson".to_string(),
            user_id: Some("wilson@clinic.test".to_string()),
            ..NewDoctor::default()
        })
        .expect("wilson");
    let alice = db
        .insert_patient(&NewPatient {
            full_name: "Alice".to_string(),
            ..NewPatient::default()
        })
        .expect("alice");
    let bob = db
        .insert_patient(&NewPatient {
            full_name: "Bob".to_string(),
            ..NewPatient::default()
        })
        .expect("bob");
    db.assign_patient(house.id, alice.id).expect("assign");
    db.assign_patient(wilson.id, alice.id).expect("assign");
    db.assign_patient(house.id, bob.id).expect("assign");

    let sessions = SessionRegistry::new();
    let api = ClinicApi::new(core, Arc::new(sessions.clone()));
    Clinic {
        _dir: dir,
        api,
        sessions,
        alice_id: alice.id,
        bob_id: bob.id,
    }
}

fn note_files(clinic: &Clinic) -> usize {
    let root = clinic.api.core().config().artifacts_root().join("notes");
    match std::fs::read_dir(root) {
        Ok(entries) => entries.filter_map(Result::ok).count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn author_round_trip_through_the_api() {
    let clinic = clinic(|_| {});
    let house = clinic.sessions.open_session(CallerIdentity::doctor("house@clinic.test")).await;

    let note = clinic
        .api
        .create_note(
            &house,
            create_payload(clinic.alice_id, "Presents with a mild fever."),
        )
        .await
        .expect("create");
    assert_eq!(note_files(&clinic), 1);

    let detail = clinic.api.read_note(&house, note.id).await.expect("read");
    assert_eq!(detail.view.note.note_text, "Presents with a mild fever.");
    assert_eq!(detail.view.author_name, "Dr. House");
    assert_eq!(detail.patient_name, "Alice");

    let artifact = clinic.api.download_note(&house, note.id).await.expect("download");
    let text = String::from_utf8(artifact.bytes).expect("utf8");
    assert!(text.starts_with("Doctor : Dr. House\n"));
    assert!(text.contains("Presents with a mild fever."));

    let patient = clinic.api.patient_detail(&house, clinic.alice_id).await.expect("detail");
    assert_eq!(patient.notes.len(), 1);

    let deleted = clinic.api.delete_note(&house, note.id).await.expect("delete");
    assert!(deleted.artifact_removed);
    assert_eq!(note_files(&clinic), 0);

    let history = clinic
        .api
        .list_history(&house, ListHistoryFilters::default())
        .await
        .expect("history");
    let actions: Vec<_> = history.iter().map(|entry| entry.action).collect();
    assert_eq!(actions, vec![HistoryAction::NoteDeleted, HistoryAction::NoteCreated]);
}

#[tokio::test]
async fn shared_patient_does_not_grant_edit_rights() {
    let clinic = clinic(|_| {});
    let house = clinic.sessions.open_session(CallerIdentity::doctor("house@clinic.test")).await;
    let wilson = clinic.sessions.open_session(CallerIdentity::doctor("wilson@clinic.test")).await;

    let note = clinic
        .api
        .create_note(&house, create_payload(clinic.alice_id, "Original assessment"))
        .await
        .expect("create");

    let err = clinic
        .api
        .update_note(
            &wilson,
            UpdateNotePayload {
                note_id: note.id,
                note_text: "Rewritten by a colleague".to_string(),
            },
        )
        .await
        .expect_err("colleague update");
    assert_eq!(err.status_code, 403);
    let err = clinic.api.delete_note(&wilson, note.id).await.expect_err("colleague delete");
    assert_eq!(err.status_code, 403);
    let err = clinic.api.download_note(&wilson, note.id).await.expect_err("colleague download");
    assert_eq!(err.status_code, 403);

    let detail = clinic.api.read_note(&house, note.id).await.expect("read");
    assert_eq!(detail.view.note.note_text, "Original assessment");
    assert!(detail.view.note.updated_on.is_none());

    let wilson_history = clinic
        .api
        .list_history(&wilson, ListHistoryFilters::default())
        .await
        .expect("history");
    assert!(wilson_history.is_empty());
}

#[tokio::test]
async fn legacy_download_policy_lets_any_doctor_fetch() {
    let clinic = clinic(|config| config.download_policy = DownloadPolicy::AnyDoctor);
    let house = clinic.sessions.open_session(CallerIdentity::doctor("house@clinic.test")).await;
    let wilson = clinic.sessions.open_session(CallerIdentity::doctor("wilson@clinic.test")).await;

    let note = clinic
        .api
        .create_note(&house, create_payload(clinic.alice_id, "Original assessment"))
        .await
        .expect("create");
    clinic.api.download_note(&wilson, note.id).await.expect("any doctor download");
}

#[tokio::test]
async fn roster_and_detail_follow_assignments() {
    let clinic = clinic(|_| {});
    let wilson = clinic.sessions.open_session(CallerIdentity::doctor("wilson@clinic.test")).await;

    let page = clinic
        .api
        .list_patients(&wilson, ListPatientsFilters::default())
        .await
        .expect("roster");
    assert_eq!(page.total_count, 1);
    assert_eq!(page.items[0].full_name, "Alice");
    assert_eq!(page.total_pages, 1);

    let err = clinic.api.patient_detail(&wilson, clinic.bob_id).await.expect_err("not assigned");
    assert_eq!(err.status_code, 403);

    let err = clinic
        .api
        .create_note(&wilson, create_payload(clinic.bob_id, "Should not be written"))
        .await
        .expect_err("create for unassigned patient");
    assert_eq!(err.status_code, 403);
    assert_eq!(note_files(&clinic), 0);
}

#[tokio::test]
async fn callers_without_session_or_profile_are_turned_away() {
    let clinic = clinic(|_| {});
    let err = clinic
        .api
        .list_patients("not-a-token", ListPatientsFilters::default())
        .await
        .expect_err("no session");
    assert_eq!(err.status_code, 401);
    assert_eq!(err.code, "UNAUTHENTICATED");

    let stranger = clinic.sessions.open_session(CallerIdentity::doctor("locum@clinic.test")).await;
    let err = clinic
        .api
        .create_note(&stranger, create_payload(clinic.alice_id, "No profile linked"))
        .await
        .expect_err("no profile");
    assert_eq!(err.code, "PROFILE_NOT_FOUND");
    assert_ne!(err.message, UNEXPECTED_ERROR_MESSAGE);
    assert_eq!(note_files(&clinic), 0);
}

#[tokio::test]
async fn invalid_text_is_rejected_without_side_effects() {
    let clinic = clinic(|_| {});
    let house = clinic.sessions.open_session(CallerIdentity::doctor("house@clinic.test")).await;

    let err = clinic
        .api
        .create_note(&house, create_payload(clinic.alice_id, "   "))
        .await
        .expect_err("blank");
    assert_eq!(err.status_code, 400);
    assert_eq!(note_files(&clinic), 0);
    assert!(clinic
        .api
        .list_history(&house, ListHistoryFilters::default())
        .await
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn admins_read_and_reconcile_but_cannot_edit() {
    let clinic = clinic(|config| config.orphan_grace_seconds = 0);
    let house = clinic.sessions.open_session(CallerIdentity::doctor("house@clinic.test")).await;
    let admin = clinic
        .sessions
        .open_session(CallerIdentity {
            user_id: "ops@clinic.test".to_string(),
            roles: [CallerRole::Admin].into_iter().collect(),
        })
        .await;

    let note = clinic
        .api
        .create_note(&house, create_payload(clinic.alice_id, "Original assessment"))
        .await
        .expect("create");
    let detail = clinic.api.read_note(&admin, note.id).await.expect("admin read");
    assert_eq!(detail.view.author_name, "Dr. House");

    let err = clinic
        .api
        .update_note(
            &admin,
            UpdateNotePayload {
                note_id: note.id,
                note_text: "Admin edit".to_string(),
            },
        )
        .await
        .expect_err("admin edit");
    assert_eq!(err.status_code, 403);

    let stray = clinic.api.core().config().artifacts_root().join("notes").join("Note_99_20200101000000.txt");
    std::fs::write(&stray, "left behind").expect("write stray");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let err = clinic.api.reconcile_orphan_artifacts(&house).await.expect_err("doctor sweep");
    assert_eq!(err.status_code, 403);
    let removed = clinic.api.reconcile_orphan_artifacts(&admin).await.expect("sweep");
    assert_eq!(removed, 1);
    assert!(!stray.exists());
    assert_eq!(note_files(&clinic), 1);
}

fn create_payload(patient_id: i64, note_text: &str) -> CreateNotePayload {
    CreateNotePayload {
        patient_id,
        note_text: note_text.to_string(),
    }
}
