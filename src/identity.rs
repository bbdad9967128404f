use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{CallerIdentity, Doctor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Source of authenticated callers. Login itself happens elsewhere.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve_caller_identity(&self, token: &str) -> Option<CallerIdentity>;
}

/// In-memory token table filled by whatever performs login.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, CallerIdentity>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open_session(&self, identity: CallerIdentity) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let mut sessions = self.sessions.lock().await;
        sessions.insert(token.clone(), identity);
        token
    }

    pub async fn close_session(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(token).is_some()
    }
}

#[async_trait::async_trait]
impl IdentityProvider for SessionRegistry {
    async fn resolve_caller_identity(&self, token: &str) -> Option<CallerIdentity> {
        let sessions = self.sessions.lock().await;
        sessions.get(token).cloned()
    }
}

/// Maps a caller to the doctor profile linked to its user id.
#[derive(Clone)]
pub struct IdentityResolver {
    db: Arc<Database>,
}

impl IdentityResolver {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn resolve_doctor(&self, caller: &CallerIdentity) -> AppResult<Doctor> {
        let doctor = self.db.find_doctor_by_user_id(&caller.user_id)?;
        doctor.ok_or_else(|| {
            tracing::info!(user_id = %caller.user_id, "no doctor profile linked to caller");
            AppError::ProfileNotFound("Doctor profile not found.".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{IdentityProvider, IdentityResolver, SessionRegistry};
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::models::{CallerIdentity, NewDoctor};
    use std::sync::Arc;

    #[tokio::test]
    async fn sessions_resolve_until_closed() {
        let registry = SessionRegistry::new();
        let token = registry.open_session(CallerIdentity::doctor("user-a")).await;

        let resolved = registry.resolve_caller_identity(&token).await.expect("identity");
        assert_eq!(resolved.user_id, "user-a");

        assert!(registry.close_session(&token).await);
        assert!(registry.resolve_caller_identity(&token).await.is_none());
        assert!(registry.resolve_caller_identity("unknown").await.is_none());
    }

    #[test]
    fn unlinked_caller_fails_closed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("test.db")).expect("db"));
        db.insert_doctor(&NewDoctor {
            full_name: "Dr. Unlinked".to_string(),
            ..NewDoctor::default()
        })
        .expect("insert doctor");

        let resolver = IdentityResolver::new(db.clone());
        let err = resolver
            .resolve_doctor(&CallerIdentity::doctor("nobody"))
            .expect_err("no profile");
        assert!(matches!(err, AppError::ProfileNotFound(_)));

        let linked = db
            .insert_doctor(&NewDoctor {
                full_name: "Dr. Linked".to_string(),
                user_id: Some("user-b".to_string()),
                ..NewDoctor::default()
            })
            .expect("insert doctor");
        let doctor = resolver
            .resolve_doctor(&CallerIdentity::doctor("user-b"))
            .expect("resolved");
        assert_eq!(doctor.id, linked.id);
    }
}
