use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::identity::IdentityResolver;
use crate::models::{CallerIdentity, CallerRole, ListPatientsFilters, PatientDetail, PatientId, PatientPage};
use crate::policy::{require_role, AssignmentGate};
use std::sync::Arc;

/// Patients visible to a doctor through the assignment graph.
#[derive(Clone)]
pub struct PatientRoster {
    db: Arc<Database>,
    identity: IdentityResolver,
    assignments: AssignmentGate,
    default_page_size: u32,
}

impl PatientRoster {
    pub fn new(db: Arc<Database>, default_page_size: u32) -> Self {
        Self {
            identity: IdentityResolver::new(db.clone()),
            assignments: AssignmentGate::new(db.clone()),
            db,
            default_page_size,
        }
    }

    pub fn list(&self, caller: &CallerIdentity, filters: &ListPatientsFilters) -> AppResult<PatientPage> {
        let page = filters.page.unwrap_or(1);
        let page_size = filters.page_size.unwrap_or(self.default_page_size);
        if page == 0 {
            return Err(AppError::Validation("Page must be 1 or greater.".to_string()));
        }
        if page_size == 0 {
            return Err(AppError::Validation("Page size must be 1 or greater.".to_string()));
        }

        require_role(caller, CallerRole::Doctor).enforce("list patients")?;
        let doctor = self.identity.resolve_doctor(caller)?;

        let search = filters
            .search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty());
        let offset = u64::from(page - 1) * u64::from(page_size);
        let (items, total_count) = self
            .db
            .list_patients_for_doctor(doctor.id, search, offset, page_size)?;

        Ok(PatientPage {
            items,
            total_count,
            page,
            page_size,
            total_pages: total_pages(total_count, page_size),
        })
    }

    /// Unassigned and nonexistent patients both come back as `Unauthorized`.
    pub fn detail(&self, caller: &CallerIdentity, patient_id: PatientId) -> AppResult<PatientDetail> {
        require_role(caller, CallerRole::Doctor).enforce("view patients")?;
        let doctor = self.identity.resolve_doctor(caller)?;
        self.assignments
            .check(doctor.id, patient_id)?
            .enforce("view this patient")?;

        let patient = self.db.get_patient(patient_id)?.ok_or_else(|| {
            tracing::error!(patient_id, doctor_id = doctor.id, "assignment references a missing patient");
            AppError::Unauthorized("You are not allowed to view this patient.".to_string())
        })?;
        let notes = self.db.list_notes_for_patient(patient_id)?;
        Ok(PatientDetail { patient, notes })
    }
}

pub fn total_pages(total_count: u64, page_size: u32) -> u32 {
    if page_size == 0 {
        return 0;
    }
    let pages = total_count.div_ceil(u64::from(page_size));
    u32::try_from(pages).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::{total_pages, PatientRoster};
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::models::{CallerIdentity, ListPatientsFilters, NewDoctor, NewPatient};
    use std::sync::Arc;

    fn roster_with_patients(count: usize) -> (tempfile::TempDir, Arc<Database>, PatientRoster) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        let mine = db
            .insert_doctor(&NewDoctor {
                full_name: "Dr. Mine".to_string(),
                user_id: Some("mine".to_string()),
                ..NewDoctor::default()
            })
            .expect("doctor");
        let theirs = db
            .insert_doctor(&NewDoctor {
                full_name: "Dr. Theirs".to_string(),
                user_id: Some("theirs".to_string()),
                ..NewDoctor::default()
            })
            .expect("doctor");

        for index in 0..count {
            let patient = db
                .insert_patient(&NewPatient {
                    full_name: format!("Patient {:02}", index),
                    ..NewPatient::default()
                })
                .expect("patient");
            db.assign_patient(mine.id, patient.id).expect("assign");
        }
        let foreign = db
            .insert_patient(&NewPatient {
                full_name: "Patient Foreign".to_string(),
                ..NewPatient::default()
            })
            .expect("patient");
        db.assign_patient(theirs.id, foreign.id).expect("assign");

        let roster = PatientRoster::new(db.clone(), 5);
        (dir, db, roster)
    }

    fn page(number: u32) -> ListPatientsFilters {
        ListPatientsFilters {
            page: Some(number),
            ..ListPatientsFilters::default()
        }
    }

    #[test]
    fn total_pages_rounds_up() {
        assert_eq!(total_pages(0, 5), 0);
        assert_eq!(total_pages(5, 5), 1);
        assert_eq!(total_pages(12, 5), 3);
    }

    #[test]
    fn last_page_holds_the_remainder_and_beyond_is_empty() {
        let (_dir, _db, roster) = roster_with_patients(12);
        let caller = CallerIdentity::doctor("mine");

        let first = roster.list(&caller, &page(1)).expect("page 1");
        assert_eq!(first.items.len(), 5);
        assert_eq!(first.total_count, 12);
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.items[0].full_name, "Patient 00");

        let last = roster.list(&caller, &page(3)).expect("page 3");
        assert_eq!(last.items.len(), 2);
        assert_eq!(last.items[1].full_name, "Patient 11");

        let beyond = roster.list(&caller, &page(4)).expect("page 4");
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total_count, 12);
    }

    #[test]
    fn exact_multiple_fills_the_last_page() {
        let (_dir, _db, roster) = roster_with_patients(10);
        let caller = CallerIdentity::doctor("mine");

        let last = roster.list(&caller, &page(2)).expect("page 2");
        assert_eq!(last.items.len(), 5);
        assert_eq!(last.total_count, 10);
        assert_eq!(last.total_pages, 2);
        assert_eq!(last.items[4].full_name, "Patient 09");

        let beyond = roster.list(&caller, &page(3)).expect("page 3");
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total_pages, 2);
    }

    #[test]
    fn listing_is_scoped_to_assignments_and_search() {
        let (_dir, _db, roster) = roster_with_patients(3);
        let caller = CallerIdentity::doctor("mine");

        let all = roster.list(&caller, &page(1)).expect("list");
        assert!(all.items.iter().all(|patient| patient.full_name != "Patient Foreign"));

        let filtered = roster
            .list(
                &caller,
                &ListPatientsFilters {
                    search: Some("  01 ".to_string()),
                    ..ListPatientsFilters::default()
                },
            )
            .expect("search");
        assert_eq!(filtered.total_count, 1);
        assert_eq!(filtered.items[0].full_name, "Patient 01");

        let wildcard = roster
            .list(
                &caller,
                &ListPatientsFilters {
                    search: Some("%".to_string()),
                    ..ListPatientsFilters::default()
                },
            )
            .expect("literal percent");
        assert_eq!(wildcard.total_count, 0);
    }

    #[test]
    fn zero_page_is_rejected() {
        let (_dir, _db, roster) = roster_with_patients(1);
        let err = roster
            .list(&CallerIdentity::doctor("mine"), &page(0))
            .expect_err("page 0");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn detail_requires_assignment() {
        let (_dir, db, roster) = roster_with_patients(1);
        let caller = CallerIdentity::doctor("mine");
        let own = roster.list(&caller, &page(1)).expect("list").items[0].clone();

        let detail = roster.detail(&caller, own.id).expect("detail");
        assert_eq!(detail.patient, own);
        assert!(detail.notes.is_empty());

        let foreign = db
            .list_patients_for_doctor(2, None, 0, 5)
            .expect("foreign list")
            .0[0]
            .id;
        let err = roster.detail(&caller, foreign).expect_err("unassigned");
        assert!(matches!(err, AppError::Unauthorized(_)));
        let err = roster.detail(&caller, 9_999).expect_err("missing");
        assert!(matches!(err, AppError::Unauthorized(_)));
    }
}
