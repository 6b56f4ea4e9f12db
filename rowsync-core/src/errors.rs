use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

use crate::models::RowId;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    #[error("node id {0} outside the valid range 0..=1023")]
    BadNodeId(u16),

    #[error("no id allocator bound for this context")]
    NoAllocatorBound,

    #[error("foreign key cycle among mirrored entities: {0}")]
    SchemaCycle(String),

    #[error("invalid entity definition: {0}")]
    InvalidEntity(String),

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("row {row_id} not found in {table}")]
    RowNotFound { table: String, row_id: RowId },

    #[error("transport error: {0}")]
    Transport(String),

    #[error(
        "version gap applying change {change_id} to {table}: expected version {expected}, got {actual}"
    )]
    VersionGap {
        change_id: u64,
        table: String,
        expected: u64,
        actual: u64,
    },

    #[error("failed to apply change {change_id} to {table}: {reason}")]
    ApplyFailed {
        change_id: u64,
        table: String,
        reason: String,
    },

    #[error("node registry has no free ids")]
    RegistryExhausted,

    #[error("registration denied: {0}")]
    RegistrationDenied(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn transport(message: impl Into<String>) -> Self {
        SyncError::Transport(message.into())
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        #[derive(serde::Serialize)]
        struct ErrorResponse {
            message: String,
        }

        let (status, message) = match &self {
            SyncError::BadNodeId(_)
            | SyncError::UnknownEntity(_)
            | SyncError::InvalidEntity(_)
            | SyncError::Serialization(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            SyncError::VersionGap { .. } | SyncError::ApplyFailed { .. } => {
                (StatusCode::CONFLICT, self.to_string())
            }
            SyncError::RegistryExhausted => (StatusCode::CONFLICT, self.to_string()),
            _ => {
                warn!("internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Unexpected Error".to_string(),
                )
            }
        };

        (status, axum::Json(ErrorResponse { message })).into_response()
    }
}
