use crate::db::Database;
use crate::errors::AppResult;
use crate::identity::IdentityResolver;
use crate::models::{CallerIdentity, CallerRole, HistoryEntry, ListHistoryFilters};
use crate::policy::require_role;
use std::sync::Arc;

/// Audit trail of the caller's own note activity, newest first.
///
/// Scoped by authorship of the entry, not by patient assignment: a doctor
/// never sees another doctor's entries even for a shared patient.
#[derive(Clone)]
pub struct HistoryProjection {
    db: Arc<Database>,
    identity: IdentityResolver,
}

impl HistoryProjection {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            identity: IdentityResolver::new(db.clone()),
            db,
        }
    }

    pub fn list(&self, caller: &CallerIdentity, filters: &ListHistoryFilters) -> AppResult<Vec<HistoryEntry>> {
        require_role(caller, CallerRole::Doctor).enforce("view history")?;
        let doctor = self.identity.resolve_doctor(caller)?;
        let search = filters
            .search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty());
        self.db.list_history_for_doctor(doctor.id, search)
    }
}
