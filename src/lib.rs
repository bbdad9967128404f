pub mod blob;
pub mod boundary;
pub mod config;
pub mod db;
pub mod errors;
pub mod history;
pub mod identity;
pub mod models;
pub mod notes;
pub mod policy;
pub mod roster;
pub mod service;

use crate::boundary::{guarded_blocking, ClientError};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::identity::IdentityProvider;
use crate::models::{
    CallerIdentity, CallerRole, CreateNotePayload, DeletedNote, HistoryEntry, ListHistoryFilters,
    ListPatientsFilters, Note, NoteArtifact, NoteDetail, NoteId, PatientDetail, PatientId, PatientPage,
    UpdateNotePayload,
};
use crate::policy::require_role;
use crate::service::ClinicCore;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Request surface: resolves the session token, then runs the operation
/// behind the fault boundary.
#[derive(Clone)]
pub struct ClinicApi {
    core: Arc<ClinicCore>,
    identities: Arc<dyn IdentityProvider>,
}

impl ClinicApi {
    pub fn new(core: Arc<ClinicCore>, identities: Arc<dyn IdentityProvider>) -> Self {
        Self { core, identities }
    }

    pub fn core(&self) -> &Arc<ClinicCore> {
        &self.core
    }

    pub async fn create_note(&self, token: &str, payload: CreateNotePayload) -> Result<Note, ClientError> {
        let caller = self.caller(token).await?;
        let core = self.core.clone();
        guarded_blocking("create_note", move || core.create_note(&caller, &payload)).await
    }

    pub async fn read_note(&self, token: &str, note_id: NoteId) -> Result<NoteDetail, ClientError> {
        let caller = self.caller(token).await?;
        let core = self.core.clone();
        guarded_blocking("read_note", move || core.read_note(&caller, note_id)).await
    }

    pub async fn update_note(&self, token: &str, payload: UpdateNotePayload) -> Result<Note, ClientError> {
        let caller = self.caller(token).await?;
        let core = self.core.clone();
        guarded_blocking("update_note", move || core.update_note(&caller, &payload)).await
    }

    pub async fn delete_note(&self, token: &str, note_id: NoteId) -> Result<DeletedNote, ClientError> {
        let caller = self.caller(token).await?;
        let core = self.core.clone();
        guarded_blocking("delete_note", move || core.delete_note(&caller, note_id)).await
    }

    pub async fn download_note(&self, token: &str, note_id: NoteId) -> Result<NoteArtifact, ClientError> {
        let caller = self.caller(token).await?;
        let core = self.core.clone();
        guarded_blocking("download_note", move || core.download_note(&caller, note_id)).await
    }

    pub async fn list_patients(&self, token: &str, filters: ListPatientsFilters) -> Result<PatientPage, ClientError> {
        let caller = self.caller(token).await?;
        let core = self.core.clone();
        guarded_blocking("list_patients", move || core.list_patients(&caller, &filters)).await
    }

    pub async fn patient_detail(&self, token: &str, patient_id: PatientId) -> Result<PatientDetail, ClientError> {
        let caller = self.caller(token).await?;
        let core = self.core.clone();
        guarded_blocking("patient_detail", move || core.patient_detail(&caller, patient_id)).await
    }

    pub async fn list_history(
        &self,
        token: &str,
        filters: ListHistoryFilters,
    ) -> Result<Vec<HistoryEntry>, ClientError> {
        let caller = self.caller(token).await?;
        let core = self.core.clone();
        guarded_blocking("list_history", move || core.list_history(&caller, &filters)).await
    }

    /// Admin-only sweep of artifacts no note references. Returns the number removed.
    pub async fn reconcile_orphan_artifacts(&self, token: &str) -> Result<usize, ClientError> {
        let caller = self.caller(token).await?;
        let core = self.core.clone();
        guarded_blocking("reconcile_orphan_artifacts", move || {
            require_role(&caller, CallerRole::Admin).enforce("reconcile note artifacts")?;
            core.reconcile_orphan_artifacts()
        })
        .await
    }

    async fn caller(&self, token: &str) -> Result<CallerIdentity, ClientError> {
        match self.identities.resolve_caller_identity(token).await {
            Some(caller) => Ok(caller),
            None => {
                tracing::info!("request carried no valid session");
                Err(ClientError::unauthenticated())
            }
        }
    }
}

/// Loads config, installs file logging and opens the core.
pub fn start(config_path: Option<&Path>) -> AppResult<Arc<ClinicCore>> {
    let config = match config_path {
        Some(path) => AppConfig::load(path)?,
        None => {
            let mut config = AppConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };

    std::fs::create_dir_all(&config.data_dir)?;
    init_tracing(&config.log_path(), &config.log_filter)?;
    tracing::info!(data_dir = %config.data_dir.display(), "starting clinic core");
    ClinicCore::open(config)
}

pub fn init_tracing(log_dir: &Path, default_filter: &str) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "docnotes.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
