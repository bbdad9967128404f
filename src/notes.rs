use crate::blob::{BlobPath, BlobSurface, NOTES_DIR};
use crate::config::{AppConfig, DownloadPolicy};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::identity::IdentityResolver;
use crate::models::{
    CallerIdentity, CallerRole, CreateNotePayload, DeletedNote, Doctor, Note, NoteArtifact, NoteDetail, NoteId,
    PatientId, UpdateNotePayload,
};
use crate::policy::{require_role, AssignmentGate, OwnershipGate};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

const MAX_ARTIFACT_PATH_ATTEMPTS: u32 = 32;
const SAVE_FAILED_MESSAGE: &str = "Unable to save note. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteSettings {
    pub min_note_chars: usize,
    pub create_requires_assignment: bool,
    pub download_policy: DownloadPolicy,
    pub rewrite_artifact_on_update: bool,
}

impl From<&AppConfig> for NoteSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            min_note_chars: config.min_note_chars,
            create_requires_assignment: config.create_requires_assignment,
            download_policy: config.download_policy,
            rewrite_artifact_on_update: config.rewrite_artifact_on_update,
        }
    }
}

impl Default for NoteSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Step of the create sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DualWriteStage {
    BeginTransaction,
    ArtifactPath,
    BlobWrite,
    RowInsert,
    Commit,
}

/// What happened to the blob after a failed create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    NotNeeded,
    BlobRemoved(BlobPath),
    /// The compensating delete failed; the blob has no referencing row.
    BlobOrphaned(BlobPath),
}

#[derive(Debug)]
pub enum DualWriteOutcome {
    Committed(Note),
    RolledBack {
        stage: DualWriteStage,
        compensation: Compensation,
        cause: AppError,
    },
}

impl DualWriteOutcome {
    /// Collapses a failure into the generic persistence error the caller sees.
    pub fn into_result(self) -> AppResult<Note> {
        match self {
            Self::Committed(note) => Ok(note),
            Self::RolledBack {
                stage,
                compensation,
                cause,
            } => {
                match &compensation {
                    Compensation::BlobOrphaned(path) => tracing::error!(
                        stage = ?stage,
                        path = %path,
                        error = %cause,
                        "note create failed and the artifact could not be removed"
                    ),
                    _ => tracing::warn!(
                        stage = ?stage,
                        compensation = ?compensation,
                        error = %cause,
                        "note create rolled back"
                    ),
                }
                Err(AppError::Persistence(SAVE_FAILED_MESSAGE.to_string()))
            }
        }
    }
}

/// Keeps a note's relational row and its text artifact moving together.
///
/// Create writes the blob first, inserts the row inside an open transaction,
/// then commits; any failure rolls the transaction back and deletes the blob.
/// A crash between blob write and commit can still leave an unreferenced
/// blob, which `reconcile_orphan_artifacts` sweeps up after a grace period.
#[derive(Clone)]
pub struct NoteWriteCoordinator {
    db: Arc<Database>,
    blobs: Arc<dyn BlobSurface>,
    identity: IdentityResolver,
    assignments: AssignmentGate,
    ownership: OwnershipGate,
    settings: NoteSettings,
}

impl NoteWriteCoordinator {
    pub fn new(db: Arc<Database>, blobs: Arc<dyn BlobSurface>, settings: NoteSettings) -> Self {
        Self {
            identity: IdentityResolver::new(db.clone()),
            assignments: AssignmentGate::new(db.clone()),
            ownership: OwnershipGate,
            db,
            blobs,
            settings,
        }
    }

    pub fn create(&self, caller: &CallerIdentity, payload: &CreateNotePayload) -> AppResult<Note> {
        validate_note_text(&payload.note_text, self.settings.min_note_chars)?;
        require_role(caller, CallerRole::Doctor).enforce("write notes")?;
        let doctor = self.identity.resolve_doctor(caller)?;

        if self.settings.create_requires_assignment {
            self.assignments
                .check(doctor.id, payload.patient_id)?
                .enforce("add notes for this patient")?;
        }

        let note = self
            .dual_write(&doctor, payload.patient_id, &payload.note_text)
            .into_result()?;
        tracing::info!(
            note_id = note.id,
            patient_id = note.patient_id,
            doctor_id = note.doctor_id,
            "note created"
        );
        Ok(note)
    }

    /// Blob first, row second, commit last; compensates on every failure path.
    pub fn dual_write(&self, doctor: &Doctor, patient_id: PatientId, note_text: &str) -> DualWriteOutcome {
        let created_on = Utc::now();
        let content = render_artifact(&doctor.full_name, patient_id, created_on, note_text);

        let tx = match self.db.begin() {
            Ok(tx) => tx,
            Err(cause) => {
                return DualWriteOutcome::RolledBack {
                    stage: DualWriteStage::BeginTransaction,
                    compensation: Compensation::NotNeeded,
                    cause,
                }
            }
        };

        let path = match self.next_artifact_path(patient_id, created_on) {
            Ok(path) => path,
            Err(cause) => {
                rollback_quietly(tx);
                return DualWriteOutcome::RolledBack {
                    stage: DualWriteStage::ArtifactPath,
                    compensation: Compensation::NotNeeded,
                    cause,
                };
            }
        };

        if let Err(cause) = self.blobs.write(&path, content.as_bytes()) {
            rollback_quietly(tx);
            return DualWriteOutcome::RolledBack {
                stage: DualWriteStage::BlobWrite,
                compensation: self.compensate(&path),
                cause,
            };
        }

        let inserted = tx
            .insert_note(patient_id, doctor.id, note_text, Some(path.as_str()), created_on)
            .and_then(|note_id| {
                tx.get_note(note_id)?
                    .ok_or_else(|| AppError::Internal(format!("note {} vanished after insert", note_id)))
            });
        let note = match inserted {
            Ok(note) => note,
            Err(cause) => {
                rollback_quietly(tx);
                return DualWriteOutcome::RolledBack {
                    stage: DualWriteStage::RowInsert,
                    compensation: self.compensate(&path),
                    cause,
                };
            }
        };

        if let Err(cause) = tx.commit() {
            return DualWriteOutcome::RolledBack {
                stage: DualWriteStage::Commit,
                compensation: self.compensate(&path),
                cause,
            };
        }

        DualWriteOutcome::Committed(note)
    }

    pub fn update(&self, caller: &CallerIdentity, payload: &UpdateNotePayload) -> AppResult<Note> {
        require_role(caller, CallerRole::Doctor).enforce("edit notes")?;
        let doctor = self.identity.resolve_doctor(caller)?;

        let existing = self
            .db
            .get_note_with_author(payload.note_id)?
            .ok_or_else(|| AppError::NotFound("Note not found.".to_string()))?;
        self.ownership
            .check(&doctor, &existing)
            .enforce("edit this note")?;
        validate_note_text(&payload.note_text, self.settings.min_note_chars)?;

        let updated_on = Utc::now();
        let tx = self.db.begin().map_err(persistence_failure)?;
        if !tx
            .update_note_text(payload.note_id, &payload.note_text, updated_on)
            .map_err(persistence_failure)?
        {
            return Err(AppError::NotFound("Note not found.".to_string()));
        }
        let note = tx
            .get_note(payload.note_id)
            .map_err(persistence_failure)?
            .ok_or_else(|| AppError::NotFound("Note not found.".to_string()))?;
        tx.commit().map_err(persistence_failure)?;

        tracing::info!(note_id = note.id, doctor_id = doctor.id, "note updated");

        if self.settings.rewrite_artifact_on_update {
            self.rewrite_artifact(&doctor, &note);
        }
        Ok(note)
    }

    pub fn delete(&self, caller: &CallerIdentity, note_id: NoteId) -> AppResult<DeletedNote> {
        require_role(caller, CallerRole::Doctor).enforce("delete notes")?;
        let doctor = self.identity.resolve_doctor(caller)?;

        let existing = self
            .db
            .get_note_with_author(note_id)?
            .ok_or_else(|| AppError::NotFound("Note not found.".to_string()))?;
        self.ownership
            .check(&doctor, &existing)
            .enforce("delete this note")?;
        let file_path = existing.note.file_path.clone();

        let tx = self.db.begin().map_err(persistence_failure)?;
        if !tx.delete_note(note_id).map_err(persistence_failure)? {
            return Err(AppError::NotFound("Note not found.".to_string()));
        }
        tx.commit().map_err(persistence_failure)?;
        tracing::info!(note_id, patient_id = existing.note.patient_id, doctor_id = doctor.id, "note deleted");

        let artifact_removed = match file_path.as_deref() {
            Some(raw) => self.remove_artifact(note_id, raw),
            None => true,
        };

        Ok(DeletedNote {
            note: existing.note,
            artifact_removed,
        })
    }

    pub fn read(&self, caller: &CallerIdentity, note_id: NoteId) -> AppResult<NoteDetail> {
        let doctor = self.resolve_reader(caller)?;
        let detail = self
            .db
            .get_note_detail(note_id)?
            .ok_or_else(|| AppError::NotFound("Note not found.".to_string()))?;
        self.ownership
            .check_view(caller, doctor.as_ref(), &detail.view)
            .enforce("view this note")?;
        Ok(detail)
    }

    pub fn download(&self, caller: &CallerIdentity, note_id: NoteId) -> AppResult<NoteArtifact> {
        let doctor = self.resolve_reader(caller)?;
        let view = self
            .db
            .get_note_with_author(note_id)?
            .ok_or_else(|| AppError::NotFound("Note not found.".to_string()))?;
        self.ownership
            .check_download(self.settings.download_policy, caller, doctor.as_ref(), &view)
            .enforce("download this note")?;

        let raw = view
            .note
            .file_path
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .ok_or_else(|| AppError::NotFound("Note file not found.".to_string()))?;
        let path = BlobPath::parse(raw).map_err(|error| {
            tracing::warn!(note_id, path = raw, error = %error, "stored artifact path is not addressable");
            AppError::NotFound("Note file not found.".to_string())
        })?;
        let bytes = self.blobs.read(&path).map_err(|error| match error {
            AppError::NotFound(_) => {
                tracing::warn!(note_id, path = %path, "note row references a missing artifact");
                AppError::NotFound("Note file not found.".to_string())
            }
            other => persistence_failure(other),
        })?;

        Ok(NoteArtifact {
            note_id,
            file_name: path.file_name().to_string(),
            content_type: "text/plain".to_string(),
            bytes,
        })
    }

    /// Deletes artifacts under `notes/` that no row references and that are
    /// older than `grace`. Returns how many were removed.
    pub fn reconcile_orphan_artifacts(&self, grace: Duration) -> AppResult<usize> {
        let referenced = self.db.referenced_note_paths()?;
        let cutoff = Utc::now() - grace;
        let mut removed = 0usize;

        for listing in self.blobs.list(NOTES_DIR)? {
            if referenced.contains(listing.path.as_str()) {
                continue;
            }
            // Unknown age counts as too young: it may belong to an in-flight create.
            if listing.modified_at.map_or(true, |modified| modified > cutoff) {
                continue;
            }
            match self.blobs.delete(&listing.path) {
                Ok(()) => removed += 1,
                Err(error) => {
                    tracing::warn!(path = %listing.path, error = %error, "failed to remove orphaned artifact");
                }
            }
        }

        if removed > 0 {
            tracing::warn!(count = removed, "removed orphaned note artifacts");
        }
        Ok(removed)
    }

    fn resolve_reader(&self, caller: &CallerIdentity) -> AppResult<Option<Doctor>> {
        if caller.has_role(CallerRole::Admin) {
            return self.db.find_doctor_by_user_id(&caller.user_id);
        }
        require_role(caller, CallerRole::Doctor).enforce("view notes")?;
        self.identity.resolve_doctor(caller).map(Some)
    }

    fn next_artifact_path(&self, patient_id: PatientId, at: DateTime<Utc>) -> AppResult<BlobPath> {
        for attempt in 1..=MAX_ARTIFACT_PATH_ATTEMPTS {
            let candidate = BlobPath::note_artifact(patient_id, at, attempt);
            if !self.blobs.exists(&candidate)? {
                return Ok(candidate);
            }
        }
        Err(AppError::Persistence(format!(
            "no free artifact path for patient {} at {}",
            patient_id,
            at.format("%Y%m%d%H%M%S")
        )))
    }

    fn compensate(&self, path: &BlobPath) -> Compensation {
        match self.blobs.delete(path) {
            Ok(()) => Compensation::BlobRemoved(path.clone()),
            Err(error) => {
                tracing::error!(path = %path, error = %error, "compensating artifact delete failed");
                Compensation::BlobOrphaned(path.clone())
            }
        }
    }

    fn remove_artifact(&self, note_id: NoteId, raw: &str) -> bool {
        let path = match BlobPath::parse(raw) {
            Ok(path) => path,
            Err(error) => {
                tracing::warn!(note_id, path = raw, error = %error, "skipping artifact cleanup for unaddressable path");
                return false;
            }
        };
        match self.blobs.delete(&path) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(note_id, path = %path, error = %error, "note deleted but artifact cleanup failed");
                false
            }
        }
    }

    fn rewrite_artifact(&self, doctor: &Doctor, note: &Note) {
        let Some(raw) = note.file_path.as_deref() else {
            return;
        };
        let result = BlobPath::parse(raw).and_then(|path| {
            let stamp = note.updated_on.unwrap_or(note.created_on);
            let content = render_artifact(&doctor.full_name, note.patient_id, stamp, &note.note_text);
            self.blobs.write(&path, content.as_bytes())
        });
        if let Err(error) = result {
            tracing::warn!(note_id = note.id, error = %error, "artifact rewrite after update failed");
        }
    }
}

pub fn validate_note_text(note_text: &str, min_chars: usize) -> AppResult<()> {
    if note_text.trim().is_empty() {
        return Err(AppError::Validation("Clinical note is required".to_string()));
    }
    if note_text.chars().count() < min_chars {
        return Err(AppError::Validation(format!(
            "Note must be at least {} characters",
            min_chars
        )));
    }
    Ok(())
}

pub fn render_artifact(doctor_name: &str, patient_id: PatientId, at: DateTime<Utc>, note_text: &str) -> String {
    format!(
        "Doctor : {}\nPatient ID : {}\nDate : {}\n\n-------------------------\n{}\n-------------------------",
        doctor_name,
        patient_id,
        at.format("%Y-%m-%d %H:%M:%S"),
        note_text
    )
}

fn rollback_quietly(tx: crate::db::StoreTransaction<'_>) {
    if let Err(error) = tx.rollback() {
        tracing::error!(error = %error, "transaction rollback failed");
    }
}

fn persistence_failure(error: AppError) -> AppError {
    match error {
        AppError::Persistence(detail) | AppError::Internal(detail) => {
            tracing::error!(error = %detail, "note store operation failed");
            AppError::Persistence(SAVE_FAILED_MESSAGE.to_string())
        }
        other => other,
    }
}
