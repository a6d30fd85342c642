use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;

/// Error taxonomy for the orchestration core. Each kind maps to one HTTP
/// status; WebSocket handlers convert these into `error` events instead.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Duplicate(String),
    /// Valid data that violates a workflow rule (bad transition, wrong
    /// turn, retry limit exceeded, delete-while-processing).
    #[error("{0}")]
    BusinessRule(String),
    #[error("{0}")]
    ExternalService(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Duplicate(_) => StatusCode::CONFLICT,
            ServiceError::BusinessRule(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::ExternalService(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Configuration(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

// Any database failure mid-operation surfaces as an internal error; the
// enclosing transaction (if any) is rolled back on drop.
impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Internal(e.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
