use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use uuid::Uuid;

pub const UNEXPECTED_ERROR_MESSAGE: &str = "An unexpected error occurred. Please try again later.";

thread_local! {
    static INSIDE_BOUNDARY: Cell<bool> = const { Cell::new(false) };
}

/// What a caller is allowed to see about a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientError {
    pub status_code: u16,
    pub code: String,
    pub message: String,
}

impl ClientError {
    pub fn unexpected() -> Self {
        Self {
            status_code: 500,
            code: "UNEXPECTED".to_string(),
            message: UNEXPECTED_ERROR_MESSAGE.to_string(),
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            status_code: 401,
            code: "UNAUTHENTICATED".to_string(),
            message: "Please sign in to continue.".to_string(),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status_code, self.message)
    }
}

impl std::error::Error for ClientError {}

/// Logs the detail and replaces it with a fixed message per kind.
/// Validation messages describe the caller's own input and pass through.
pub fn to_client_error(error: AppError) -> ClientError {
    let (status_code, message) = match &error {
        AppError::Validation(detail) => {
            tracing::info!(code = error.kind(), detail = %detail, "request rejected");
            (400, detail.clone())
        }
        AppError::ProfileNotFound(detail) => {
            tracing::info!(code = error.kind(), detail = %detail, "request rejected");
            (401, "Doctor profile not found.".to_string())
        }
        AppError::NotFound(detail) => {
            tracing::info!(code = error.kind(), detail = %detail, "request rejected");
            (404, "The requested record was not found.".to_string())
        }
        AppError::Unauthorized(detail) => {
            tracing::warn!(code = error.kind(), detail = %detail, "request denied");
            (403, "You are not authorized to perform this action.".to_string())
        }
        AppError::Persistence(detail) => {
            tracing::error!(code = error.kind(), detail = %detail, "request failed in storage");
            (500, "Unable to save changes. Please try again.".to_string())
        }
        AppError::Internal(detail) => {
            tracing::error!(code = error.kind(), detail = %detail, "request failed");
            (500, UNEXPECTED_ERROR_MESSAGE.to_string())
        }
    };
    ClientError {
        status_code,
        code: error.kind().to_string(),
        message,
    }
}

/// Outermost fault boundary for one request.
///
/// Runs `work` once. Errors become `ClientError`s and a panic becomes the
/// generic unexpected-error response. A call made while another boundary is
/// already active on this thread does not catch again.
pub fn guarded<T>(operation: &str, work: impl FnOnce() -> AppResult<T>) -> Result<T, ClientError> {
    if INSIDE_BOUNDARY.with(Cell::get) {
        return work().map_err(to_client_error);
    }

    let request_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("request", operation, request_id = %request_id);
    let _entered = span.enter();
    let _scope = BoundaryScope::enter();

    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => result.map_err(to_client_error),
        Err(payload) => {
            tracing::error!(panic = %panic_message(payload.as_ref()), "request panicked");
            Err(ClientError::unexpected())
        }
    }
}

/// Runs blocking store work on the blocking pool behind the boundary.
pub async fn guarded_blocking<T, F>(operation: &'static str, work: F) -> Result<T, ClientError>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    let span = tracing::Span::current();
    match tokio::task::spawn_blocking(move || span.in_scope(|| guarded(operation, work))).await {
        Ok(result) => result,
        Err(join_error) => {
            tracing::error!(operation, error = %join_error, "request task did not complete");
            Err(ClientError::unexpected())
        }
    }
}

struct BoundaryScope;

impl BoundaryScope {
    fn enter() -> Self {
        INSIDE_BOUNDARY.with(|flag| flag.set(true));
        Self
    }
}

impl Drop for BoundaryScope {
    fn drop(&mut self) {
        INSIDE_BOUNDARY.with(|flag| flag.set(false));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
