use axum::{response::IntoResponse, Json};
use diesel::result::{DatabaseErrorKind, Error as DieselError};

/// Engine errors. An empty queue is not one of these; dispatch reports it
/// through `DispatchOutcome::Empty`.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid operator: {0}")]
    InvalidOperator(String),
    #[error("Operator not eligible: {0}")]
    NotEligible(String),
    #[error("Operator already busy: {0}")]
    AlreadyBusy(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Busy, retry later: {0}")]
    Busy(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Database error: {0}")]
    Database(String),
}

impl From<DieselError> for QueueError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound("record not found".to_string()),
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
                Self::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(_, info)
                if info.message().contains("lock timeout")
                    || info.message().contains("could not obtain lock") =>
            {
                Self::Busy(info.message().to_string())
            }
            other => Self::Database(other.to_string()),
        }
    }
}

impl IntoResponse for QueueError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::InvalidOperator(msg) | Self::NotEligible(msg) | Self::Validation(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
            Self::AlreadyBusy(msg) | Self::InvalidTransition(msg) | Self::Conflict(msg) => {
                (StatusCode::CONFLICT, msg.clone())
            }
            Self::Busy(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            Self::Database(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
