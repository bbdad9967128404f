use crate::blob::{BlobSurface, FsBlobSurface};
use crate::config::AppConfig;
use crate::db::Database;
use crate::errors::AppResult;
use crate::history::HistoryProjection;
use crate::models::{
    CallerIdentity, CreateNotePayload, DeletedNote, HistoryEntry, ListHistoryFilters, ListPatientsFilters, Note,
    NoteArtifact, NoteDetail, NoteId, PatientDetail, PatientId, PatientPage, UpdateNotePayload,
};
use crate::notes::{NoteSettings, NoteWriteCoordinator};
use crate::roster::PatientRoster;
use chrono::Duration;
use std::sync::Arc;

const MAX_ORPHAN_GRACE_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Everything a request needs, wired once at startup.
pub struct ClinicCore {
    db: Arc<Database>,
    notes: NoteWriteCoordinator,
    roster: PatientRoster,
    history: HistoryProjection,
    config: AppConfig,
}

impl ClinicCore {
    pub fn open(config: AppConfig) -> AppResult<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db = Arc::new(Database::new(&config.database_path())?);
        let blobs: Arc<dyn BlobSurface> = Arc::new(FsBlobSurface::new(config.artifacts_root())?);
        Self::with_parts(config, db, blobs)
    }

    /// Wires the core over an existing store and blob surface.
    pub fn with_parts(config: AppConfig, db: Arc<Database>, blobs: Arc<dyn BlobSurface>) -> AppResult<Arc<Self>> {
        let this = Arc::new(Self {
            notes: NoteWriteCoordinator::new(db.clone(), blobs, NoteSettings::from(&config)),
            roster: PatientRoster::new(db.clone(), config.patients_page_size),
            history: HistoryProjection::new(db.clone()),
            db,
            config,
        });

        match this.notes.reconcile_orphan_artifacts(orphan_grace(&this.config)) {
            Ok(removed) if removed > 0 => {
                tracing::warn!(count = removed, "removed orphaned note artifacts on startup");
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(error = %error, "orphan artifact sweep failed on startup"),
        }

        Ok(this)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn seed_demo_clinic(&self) -> AppResult<bool> {
        self.db.seed_demo_clinic()
    }

    pub fn create_note(&self, caller: &CallerIdentity, payload: &CreateNotePayload) -> AppResult<Note> {
        self.notes.create(caller, payload)
    }

    pub fn read_note(&self, caller: &CallerIdentity, note_id: NoteId) -> AppResult<NoteDetail> {
        self.notes.read(caller, note_id)
    }

    pub fn update_note(&self, caller: &CallerIdentity, payload: &UpdateNotePayload) -> AppResult<Note> {
        self.notes.update(caller, payload)
    }

    pub fn delete_note(&self, caller: &CallerIdentity, note_id: NoteId) -> AppResult<DeletedNote> {
        self.notes.delete(caller, note_id)
    }

    pub fn download_note(&self, caller: &CallerIdentity, note_id: NoteId) -> AppResult<NoteArtifact> {
        self.notes.download(caller, note_id)
    }

    pub fn list_patients(&self, caller: &CallerIdentity, filters: &ListPatientsFilters) -> AppResult<PatientPage> {
        self.roster.list(caller, filters)
    }

    pub fn patient_detail(&self, caller: &CallerIdentity, patient_id: PatientId) -> AppResult<PatientDetail> {
        self.roster.detail(caller, patient_id)
    }

    pub fn list_history(&self, caller: &CallerIdentity, filters: &ListHistoryFilters) -> AppResult<Vec<HistoryEntry>> {
        self.history.list(caller, filters)
    }

    pub fn reconcile_orphan_artifacts(&self) -> AppResult<usize> {
        self.notes.reconcile_orphan_artifacts(orphan_grace(&self.config))
    }
}

fn orphan_grace(config: &AppConfig) -> Duration {
    let seconds = config.orphan_grace_seconds.min(MAX_ORPHAN_GRACE_SECONDS);
    Duration::seconds(seconds as i64)
}

#[cfg(test)]
mod tests {
    use super::ClinicCore;
    use crate::blob::{BlobPath, BlobSurface, FsBlobSurface};
    use crate::config::AppConfig;
    use crate::db::Database;
    use crate::models::{CallerIdentity, ListPatientsFilters};
    use std::sync::Arc;

    #[test]
    fn open_creates_store_and_seeds_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = ClinicCore::open(AppConfig::with_data_dir(dir.path())).expect("open");
        assert!(core.seed_demo_clinic().expect("seed"));
        assert!(!core.seed_demo_clinic().expect("second seed"));

        let page = core
            .list_patients(&CallerIdentity::doctor("Dr.Sharma@clinic.com"), &ListPatientsFilters::default())
            .expect("list");
        assert_eq!(page.total_count, 3);
        assert_eq!(page.page_size, 5);
    }

    #[test]
    fn startup_sweeps_stale_orphans() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::with_data_dir(dir.path());
        config.orphan_grace_seconds = 0;
        std::fs::create_dir_all(&config.data_dir).expect("data dir");
        let db = Arc::new(Database::new(&config.database_path()).expect("db"));
        let blobs = Arc::new(FsBlobSurface::new(config.artifacts_root()).expect("surface"));
        let orphan = BlobPath::parse("notes/Note_1_20200101000000.txt").expect("path");
        blobs.write(&orphan, b"stale").expect("write");
        std::thread::sleep(std::time::Duration::from_millis(20));

        ClinicCore::with_parts(config, db, blobs.clone()).expect("core");
        assert!(!blobs.exists(&orphan).expect("exists"));
    }
}
