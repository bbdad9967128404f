use crate::errors::{AppError, AppResult};
use crate::models::{
    Doctor, DoctorId, DoctorPatientAssignment, HistoryAction, HistoryEntry, NewDoctor, NewPatient, Note,
    NoteDetail, NoteId, NoteView, Patient, PatientId,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const NOTE_VIEW_COLUMNS: &str = "n.id, n.note_text, n.created_on, n.updated_on, n.patient_id, n.doctor_id, n.file_path,
     d.full_name, d.user_id";

const PATIENT_COLUMNS: &str = "p.id, p.full_name, p.phone, p.email, p.date_of_birth, p.blood_group, p.address,
     p.guardian_name, p.guardian_contact, p.age, p.created_at";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Persistence(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A panic while the connection was held poisons the mutex. The
    /// connection itself is still usable once any open transaction is gone,
    /// so recover it instead of failing every later request.
    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        match self.conn.lock() {
            Ok(conn) => Ok(conn),
            Err(poisoned) => self.recover(poisoned),
        }
    }

    fn recover<'a>(
        &'a self,
        poisoned: PoisonError<MutexGuard<'a, Connection>>,
    ) -> AppResult<MutexGuard<'a, Connection>> {
        let conn = poisoned.into_inner();
        self.conn.clear_poison();
        tracing::warn!("recovered database connection after a panic");
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(conn)
    }

    /// Opens a write transaction. It is rolled back unless committed.
    pub fn begin(&self) -> AppResult<StoreTransaction<'_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(StoreTransaction { conn, finished: false })
    }

    pub fn insert_doctor(&self, doctor: &NewDoctor) -> AppResult<Doctor> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO doctors (full_name, email, phone, specialty, user_id) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![doctor.full_name, doctor.email, doctor.phone, doctor.specialty, doctor.user_id],
        )?;
        Ok(Doctor {
            id: conn.last_insert_rowid(),
            full_name: doctor.full_name.clone(),
            email: doctor.email.clone(),
            phone: doctor.phone.clone(),
            specialty: doctor.specialty.clone(),
            user_id: doctor.user_id.clone(),
        })
    }

    pub fn link_doctor_user(&self, doctor_id: DoctorId, user_id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE doctors SET user_id = ?1 WHERE id = ?2",
            params![user_id, doctor_id],
        )?;
        Ok(changed > 0)
    }

    pub fn insert_patient(&self, patient: &NewPatient) -> AppResult<Patient> {
        let created_at = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO patients (
               full_name, phone, email, date_of_birth, blood_group, address,
               guardian_name, guardian_contact, age, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                patient.full_name,
                patient.phone,
                patient.email,
                patient.date_of_birth,
                patient.blood_group,
                patient.address,
                patient.guardian_name,
                patient.guardian_contact,
                patient.age,
                format_time(created_at),
            ],
        )?;
        Ok(Patient {
            id: conn.last_insert_rowid(),
            full_name: patient.full_name.clone(),
            phone: patient.phone.clone(),
            email: patient.email.clone(),
            date_of_birth: patient.date_of_birth,
            blood_group: patient.blood_group.clone(),
            address: patient.address.clone(),
            guardian_name: patient.guardian_name.clone(),
            guardian_contact: patient.guardian_contact.clone(),
            age: patient.age,
            created_at: parse_time(&format_time(created_at)).map_err(AppError::from)?,
        })
    }

    /// Creating an assignment that already exists returns the stored one.
    pub fn assign_patient(&self, doctor_id: DoctorId, patient_id: PatientId) -> AppResult<DoctorPatientAssignment> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO doctor_patients (doctor_id, patient_id, assigned_on) VALUES (?1, ?2, ?3)",
            params![doctor_id, patient_id, format_time(Utc::now())],
        )?;
        conn.query_row(
            "SELECT doctor_id, patient_id, assigned_on FROM doctor_patients WHERE doctor_id = ?1 AND patient_id = ?2",
            params![doctor_id, patient_id],
            |row| {
                Ok(DoctorPatientAssignment {
                    doctor_id: row.get(0)?,
                    patient_id: row.get(1)?,
                    assigned_on: parse_time(&row.get::<_, String>(2)?)?,
                })
            },
        )
        .map_err(AppError::from)
    }

    pub fn find_doctor_by_user_id(&self, user_id: &str) -> AppResult<Option<Doctor>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, full_name, email, phone, specialty, user_id FROM doctors WHERE user_id = ?1",
            [user_id],
            parse_doctor_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn get_doctor(&self, doctor_id: DoctorId) -> AppResult<Option<Doctor>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, full_name, email, phone, specialty, user_id FROM doctors WHERE id = ?1",
            [doctor_id],
            parse_doctor_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn is_assigned(&self, doctor_id: DoctorId, patient_id: PatientId) -> AppResult<bool> {
        let conn = self.lock()?;
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM doctor_patients WHERE doctor_id = ?1 AND patient_id = ?2)",
            params![doctor_id, patient_id],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    pub fn get_patient(&self, patient_id: PatientId) -> AppResult<Option<Patient>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM patients p WHERE p.id = ?1", PATIENT_COLUMNS),
            [patient_id],
            parse_patient_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn get_note_with_author(&self, note_id: NoteId) -> AppResult<Option<NoteView>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM notes n JOIN doctors d ON d.id = n.doctor_id WHERE n.id = ?1",
                NOTE_VIEW_COLUMNS
            ),
            [note_id],
            parse_note_view_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn get_note_detail(&self, note_id: NoteId) -> AppResult<Option<NoteDetail>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {}, p.full_name
                 FROM notes n
                 JOIN doctors d ON d.id = n.doctor_id
                 JOIN patients p ON p.id = n.patient_id
                 WHERE n.id = ?1",
                NOTE_VIEW_COLUMNS
            ),
            [note_id],
            |row| {
                Ok(NoteDetail {
                    view: parse_note_view_row(row)?,
                    patient_name: row.get(9)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_notes_for_patient(&self, patient_id: PatientId) -> AppResult<Vec<NoteView>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM notes n JOIN doctors d ON d.id = n.doctor_id
             WHERE n.patient_id = ?1
             ORDER BY n.created_on DESC, n.id DESC",
            NOTE_VIEW_COLUMNS
        ))?;
        let notes = statement
            .query_map([patient_id], parse_note_view_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(notes)
    }

    /// One page of the doctor's assigned patients plus the total under the same filter.
    /// Count and page are read under one lock so they describe the same snapshot.
    pub fn list_patients_for_doctor(
        &self,
        doctor_id: DoctorId,
        search: Option<&str>,
        offset: u64,
        limit: u32,
    ) -> AppResult<(Vec<Patient>, u64)> {
        let conn = self.lock()?;

        let mut filter = String::from(
            " FROM patients p JOIN doctor_patients dp ON dp.patient_id = p.id WHERE dp.doctor_id = ?",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(doctor_id)];
        if let Some(search) = search {
            filter.push_str(" AND p.full_name LIKE ? ESCAPE '\\'");
            params_vec.push(Box::new(format!("%{}%", escape_like(search))));
        }

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*){}", filter),
            rusqlite::params_from_iter(params_vec.iter().map(|param| param.as_ref())),
            |row| row.get(0),
        )?;

        let query = format!(
            "SELECT {}{} ORDER BY p.full_name ASC, p.id ASC LIMIT ? OFFSET ?",
            PATIENT_COLUMNS, filter
        );
        params_vec.push(Box::new(i64::from(limit)));
        params_vec.push(Box::new(i64::try_from(offset).unwrap_or(i64::MAX)));

        let mut statement = conn.prepare(&query)?;
        let patients = statement
            .query_map(
                rusqlite::params_from_iter(params_vec.iter().map(|param| param.as_ref())),
                parse_patient_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((patients, total.max(0) as u64))
    }

    pub fn list_history_for_doctor(&self, doctor_id: DoctorId, search: Option<&str>) -> AppResult<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut query = String::from(
            "SELECT h.id, h.patient_id, p.full_name, h.doctor_id, h.action, h.action_date
             FROM history h JOIN patients p ON p.id = h.patient_id
             WHERE h.doctor_id = ?",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(doctor_id)];
        if let Some(search) = search {
            query.push_str(" AND p.full_name LIKE ? ESCAPE '\\'");
            params_vec.push(Box::new(format!("%{}%", escape_like(search))));
        }
        query.push_str(" ORDER BY h.action_date DESC, h.id DESC");

        let mut statement = conn.prepare(&query)?;
        let entries = statement
            .query_map(
                rusqlite::params_from_iter(params_vec.iter().map(|param| param.as_ref())),
                |row| {
                    Ok(HistoryEntry {
                        id: row.get(0)?,
                        patient_id: row.get(1)?,
                        patient_name: row.get(2)?,
                        doctor_id: row.get(3)?,
                        action: parse_history_action(&row.get::<_, String>(4)?)?,
                        action_date: parse_time(&row.get::<_, String>(5)?)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn referenced_note_paths(&self) -> AppResult<HashSet<String>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare("SELECT file_path FROM notes WHERE file_path IS NOT NULL")?;
        let paths = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(paths)
    }

    pub fn count_doctors(&self) -> AppResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM doctors", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Provisions a small clinic when the store is empty.
    pub fn seed_demo_clinic(&self) -> AppResult<bool> {
        if self.count_doctors()? > 0 {
            return Ok(false);
        }

        let sharma = self.insert_doctor(&NewDoctor {
            full_name: "Dr. Sharma".to_string(),
            email: Some("Dr.Sharma@clinic.com".to_string()),
            specialty: Some("General Medicine".to_string()),
            user_id: Some("Dr.Sharma@clinic.com".to_string()),
            ..NewDoctor::default()
        })?;
        let mishra = self.insert_doctor(&NewDoctor {
            full_name: "Dr. Mishra".to_string(),
            email: Some("Dr.Mishra@clinic.com".to_string()),
            specialty: Some("Pediatrics".to_string()),
            user_id: Some("Dr.Mishra@clinic.com".to_string()),
            ..NewDoctor::default()
        })?;

        let names = ["Aarav Patel", "Diya Nair", "Kabir Singh", "Meera Iyer", "Rohan Das", "Sara Khan"];
        for (index, name) in names.iter().enumerate() {
            let patient = self.insert_patient(&NewPatient {
                full_name: name.to_string(),
                ..NewPatient::default()
            })?;
            let doctor = if index % 2 == 0 { &sharma } else { &mishra };
            self.assign_patient(doctor.id, patient.id)?;
        }
        tracing::info!(doctors = 2, patients = names.len(), "seeded demo clinic");
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql).map_err(AppError::from)
    }
}

/// Explicit write scope over the store connection.
///
/// Holds the connection for its whole lifetime. `commit` and `rollback`
/// consume it; dropping it unfinished rolls back.
pub struct StoreTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl StoreTransaction<'_> {
    /// Insert procedure. The `notes_history_insert` trigger appends the history row.
    pub fn insert_note(
        &self,
        patient_id: PatientId,
        doctor_id: DoctorId,
        note_text: &str,
        file_path: Option<&str>,
        created_on: DateTime<Utc>,
    ) -> AppResult<NoteId> {
        self.conn.execute(
            "INSERT INTO notes (note_text, created_on, updated_on, patient_id, doctor_id, file_path)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5)",
            params![note_text, format_time(created_on), patient_id, doctor_id, file_path],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_note_text(&self, note_id: NoteId, note_text: &str, updated_on: DateTime<Utc>) -> AppResult<bool> {
        let changed = self.conn.execute(
            "UPDATE notes SET note_text = ?1, updated_on = ?2 WHERE id = ?3",
            params![note_text, format_time(updated_on), note_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_note(&self, note_id: NoteId) -> AppResult<bool> {
        let changed = self.conn.execute("DELETE FROM notes WHERE id = ?1", [note_id])?;
        Ok(changed > 0)
    }

    pub fn get_note(&self, note_id: NoteId) -> AppResult<Option<Note>> {
        self.conn
            .query_row(
                "SELECT id, note_text, created_on, updated_on, patient_id, doctor_id, file_path FROM notes WHERE id = ?1",
                [note_id],
                parse_note_row,
            )
            .optional()
            .map_err(AppError::from)
    }

    pub fn commit(mut self) -> AppResult<()> {
        self.finished = true;
        if let Err(error) = self.conn.execute_batch("COMMIT") {
            let _ = self.conn.execute_batch("ROLLBACK");
            return Err(AppError::from(error));
        }
        Ok(())
    }

    pub fn rollback(mut self) -> AppResult<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK").map_err(AppError::from)
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(error) = self.conn.execute_batch("ROLLBACK") {
                tracing::error!(error = %error, "failed to roll back abandoned transaction");
            }
        }
    }
}

fn parse_doctor_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Doctor> {
    Ok(Doctor {
        id: row.get(0)?,
        full_name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        specialty: row.get(4)?,
        user_id: row.get(5)?,
    })
}

fn parse_patient_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Patient> {
    Ok(Patient {
        id: row.get(0)?,
        full_name: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        date_of_birth: row.get(4)?,
        blood_group: row.get(5)?,
        address: row.get(6)?,
        guardian_name: row.get(7)?,
        guardian_contact: row.get(8)?,
        age: row.get(9)?,
        created_at: parse_time(&row.get::<_, String>(10)?)?,
    })
}

fn parse_note_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        note_text: row.get(1)?,
        created_on: parse_time(&row.get::<_, String>(2)?)?,
        updated_on: row
            .get::<_, Option<String>>(3)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        patient_id: row.get(4)?,
        doctor_id: row.get(5)?,
        file_path: row.get(6)?,
    })
}

fn parse_note_view_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NoteView> {
    Ok(NoteView {
        note: parse_note_row(row)?,
        author_name: row.get(7)?,
        author_user_id: row.get(8)?,
    })
}

fn parse_history_action(raw: &str) -> rusqlite::Result<HistoryAction> {
    match raw {
        "note-created" => Ok(HistoryAction::NoteCreated),
        "note-updated" => Ok(HistoryAction::NoteUpdated),
        "note-deleted" => Ok(HistoryAction::NoteDeleted),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown history action '{}'", other),
            )),
        )),
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Millisecond UTC timestamps, the same shape the history triggers write,
/// so text ordering matches time ordering.
pub(crate) fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
