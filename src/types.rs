// Error taxonomy shared by every pipeline stage

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The file type has no conversion path. Never retried.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("File too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: u64, limit: u64 },

    /// Network timeout, 5xx or rate limiting from an external service.
    #[error("Transient service error: {0}")]
    TransientService(String),

    /// 4xx (other than rate limiting) or an unrecoverable parse result.
    #[error("Permanent service error: {0}")]
    PermanentService(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientService(_))
    }

    /// Errors rejected at intake, before any side effect.
    pub fn is_intake_rejection(&self) -> bool {
        matches!(
            self,
            AppError::UnsupportedFormat(_) | AppError::Validation(_) | AppError::FileTooLarge { .. }
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::TransientService(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PermanentService(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Storage(_) | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::UnsupportedFormat(_) => "unsupported_format",
            AppError::Validation(_) | AppError::FileTooLarge { .. } => "validation_error",
            AppError::TransientService(_) => "transient_service_error",
            AppError::PermanentService(_) => "permanent_service_error",
            AppError::Timeout(_) => "timeout",
            AppError::Storage(_) => "storage_error",
            AppError::Database(_) => "database_error",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = serde_json::json!({
            "error": self.kind(),
            "details": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(AppError::TransientService("503".into()).is_transient());
        assert!(!AppError::PermanentService("404".into()).is_transient());
        assert!(!AppError::Timeout("job".into()).is_transient());
        assert!(!AppError::UnsupportedFormat("image/gif".into()).is_transient());
    }

    #[test]
    fn test_intake_errors_map_to_client_statuses() {
        let too_large = AppError::FileTooLarge { size: 25, limit: 20 };
        assert!(too_large.is_intake_rejection());
        assert_eq!(too_large.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            AppError::UnsupportedFormat("x".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert!(!AppError::Conflict("stale".into()).is_intake_rejection());
    }
}
