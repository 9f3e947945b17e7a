use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;

use crate::error::PipelineError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Where a missing file was looked for
    pub expected_path: Option<PathBuf>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            expected_path: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Peers read the flat `error` field
        let body = match &self.expected_path {
            Some(path) => json!({
                "error": self.message,
                "expected_path": path.to_string_lossy(),
            }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound { what, path } => Self {
                status: StatusCode::NOT_FOUND,
                message: format!("{what} not found"),
                expected_path: Some(path),
            },
            PipelineError::InvalidInput(msg) => Self::bad_request(msg),
            PipelineError::NotOurs(_) | PipelineError::NotCancellable(_) => {
                Self::bad_request(err.to_string())
            }
            PipelineError::PeerUnreachable { .. } | PipelineError::PeerRejected { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, err.to_string())
            }
            PipelineError::Signal { .. } => Self::internal(err.to_string()),
            PipelineError::Io { .. } => {
                tracing::error!(error = ?err, "filesystem operation failed");
                Self::internal(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_errors_map_to_status() {
        let cases = [
            (PipelineError::not_found("ISO file", "/x.iso"), StatusCode::NOT_FOUND),
            (PipelineError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (PipelineError::NotOurs("x".into()), StatusCode::BAD_REQUEST),
            (PipelineError::NotCancellable("x".into()), StatusCode::BAD_REQUEST),
            (
                PipelineError::PeerUnreachable {
                    peer: "b".into(),
                    reason: "down".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                PipelineError::Signal {
                    pid: 1,
                    reason: "x".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn test_not_found_keeps_expected_path() {
        let err = AppError::from(PipelineError::not_found("ISO file", "/staging/M.iso"));
        assert_eq!(err.message, "ISO file not found");
        assert_eq!(err.expected_path, Some(PathBuf::from("/staging/M.iso")));
    }
}
