use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("Failed to initialize recognition engine: {0}")]
    Initialization(String),

    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Recognition engine failed: {0}")]
    EngineFailure(String),

    #[error("Preprocessing failed: {0}")]
    Preprocessing(String),

    #[error("Timed out after {waited_secs}s waiting for engine results for document {document_id}")]
    FusionTimeout {
        document_id: String,
        waited_secs: u64,
    },

    #[error("Queue item {id} is {status} and cannot be cancelled")]
    NotCancellable { id: String, status: String },

    #[error("No recognition configuration is active")]
    NoActiveConfiguration,

    #[error("Document catalog error: {0}")]
    Catalog(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RecognitionError {
    /// Whether a failed job attempt may be retried. Format errors are
    /// permanent: the same bytes will never normalize differently.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RecognitionError::UnsupportedFormat(_)
                | RecognitionError::NoActiveConfiguration
                | RecognitionError::InvalidRequest(_)
        )
    }
}

impl From<rusqlite::Error> for RecognitionError {
    fn from(err: rusqlite::Error) -> Self {
        RecognitionError::Storage(err.to_string())
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for RecognitionError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            RecognitionError::Initialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INIT_ERROR"),
            RecognitionError::UnsupportedFormat(_) => {
                (StatusCode::BAD_REQUEST, "UNSUPPORTED_FORMAT")
            }
            RecognitionError::EngineFailure(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_FAILURE")
            }
            RecognitionError::Preprocessing(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PREPROCESSING_ERROR")
            }
            RecognitionError::FusionTimeout { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "FUSION_TIMEOUT")
            }
            RecognitionError::NotCancellable { .. } => (StatusCode::CONFLICT, "NOT_CANCELLABLE"),
            RecognitionError::NoActiveConfiguration => {
                (StatusCode::CONFLICT, "NO_ACTIVE_CONFIGURATION")
            }
            RecognitionError::Catalog(_) => (StatusCode::BAD_GATEWAY, "CATALOG_ERROR"),
            RecognitionError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
            RecognitionError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            RecognitionError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            RecognitionError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}
