use crate::replay::ReplayError;
use crate::source::csv_replay::ReplayFileError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    AlreadyRunning(String),
    NotRunning(String),
    NotFound(String),
    BadRequest(String),
    /// Detail is logged, never returned.
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::AlreadyRunning(_) => StatusCode::CONFLICT,
            ApiError::NotRunning(_) | ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::AlreadyRunning(_) => "already_running",
            ApiError::NotRunning(_) => "not_running",
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = match self {
            ApiError::Internal(detail) => {
                error!(error = %detail, "Internal error");
                "internal error, retry shortly".to_string()
            }
            ApiError::AlreadyRunning(msg)
            | ApiError::NotRunning(msg)
            | ApiError::NotFound(msg)
            | ApiError::BadRequest(msg) => msg,
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

impl From<ReplayError> for ApiError {
    fn from(e: ReplayError) -> Self {
        match e {
            ReplayError::AlreadyRunning { .. } => ApiError::AlreadyRunning(e.to_string()),
            ReplayError::NotRunning { .. } => ApiError::NotRunning(e.to_string()),
            ReplayError::InvalidSpeed(_) => ApiError::BadRequest(e.to_string()),
            ReplayError::StoreWriteFailure(_) | ReplayError::Source(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<ReplayFileError> for ApiError {
    fn from(e: ReplayFileError) -> Self {
        let file_name = |path: &std::path::Path| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        };
        match e {
            ReplayFileError::InvalidName(_) => ApiError::BadRequest(e.to_string()),
            ReplayFileError::NotFound(ref path) => {
                ApiError::NotFound(format!("replay file not found: {}", file_name(path)))
            }
            ReplayFileError::NoPlays {
                ref external_id,
                ref path,
            } => ApiError::NotFound(format!(
                "no plays for game '{}' in {}",
                external_id,
                file_name(path)
            )),
            ReplayFileError::Unreadable(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", e))
    }
}
