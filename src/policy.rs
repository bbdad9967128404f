use crate::config::DownloadPolicy;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{CallerIdentity, CallerRole, Doctor, DoctorId, NoteView, PatientId};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    MissingRole(CallerRole),
    NotAssigned,
    NotAuthor,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRole(role) => write!(f, "caller lacks the {} role", role.as_str()),
            Self::NotAssigned => write!(f, "doctor is not assigned to this patient"),
            Self::NotAuthor => write!(f, "doctor is not the author of this note"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied(DenialReason),
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Turns a denial into `Unauthorized`, logging the reason but keeping it out of the message.
    pub fn enforce(self, action: &str) -> AppResult<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied(reason) => {
                tracing::info!(action, reason = %reason, "access denied");
                Err(AppError::Unauthorized(format!("You are not allowed to {}.", action)))
            }
        }
    }
}

pub fn require_role(caller: &CallerIdentity, role: CallerRole) -> AccessDecision {
    if caller.has_role(role) {
        AccessDecision::Allowed
    } else {
        AccessDecision::Denied(DenialReason::MissingRole(role))
    }
}

/// "This doctor cares for this patient": existence of an assignment row.
#[derive(Clone)]
pub struct AssignmentGate {
    db: Arc<Database>,
}

impl AssignmentGate {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn is_assigned(&self, doctor_id: DoctorId, patient_id: PatientId) -> AppResult<bool> {
        self.db.is_assigned(doctor_id, patient_id)
    }

    pub fn check(&self, doctor_id: DoctorId, patient_id: PatientId) -> AppResult<AccessDecision> {
        Ok(if self.is_assigned(doctor_id, patient_id)? {
            AccessDecision::Allowed
        } else {
            AccessDecision::Denied(DenialReason::NotAssigned)
        })
    }
}

/// Strict authorship equality. Assignment does not grant mutation rights.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnershipGate;

impl OwnershipGate {
    pub fn check(self, doctor: &Doctor, note: &NoteView) -> AccessDecision {
        if note.note.doctor_id == doctor.id {
            AccessDecision::Allowed
        } else {
            AccessDecision::Denied(DenialReason::NotAuthor)
        }
    }

    /// Viewing: the author, or any admin.
    pub fn check_view(self, caller: &CallerIdentity, doctor: Option<&Doctor>, note: &NoteView) -> AccessDecision {
        if caller.has_role(CallerRole::Admin) {
            return AccessDecision::Allowed;
        }
        match doctor {
            Some(doctor) if caller.has_role(CallerRole::Doctor) => self.check(doctor, note),
            Some(_) => AccessDecision::Denied(DenialReason::MissingRole(CallerRole::Doctor)),
            None => AccessDecision::Denied(DenialReason::NotAuthor),
        }
    }

    pub fn check_download(
        self,
        policy: DownloadPolicy,
        caller: &CallerIdentity,
        doctor: Option<&Doctor>,
        note: &NoteView,
    ) -> AccessDecision {
        match policy {
            DownloadPolicy::AuthorOrAdmin => self.check_view(caller, doctor, note),
            DownloadPolicy::AnyDoctor => require_role(caller, CallerRole::Doctor),
        }
    }
}
