use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use spheroseg_core::error::CoreError;
use spheroseg_db::store::StoreError;
use spheroseg_pipeline::PipelineError;

/// Application-level error type for HTTP handlers.
///
/// Implements [`IntoResponse`] to produce consistent `{error, code}` JSON
/// bodies. Server-side failures are logged and masked.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Core(core) => classify_core_error(core),
            AppError::Pipeline(PipelineError::Validation(msg)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg)
            }
            AppError::Pipeline(PipelineError::Queue(core)) => classify_core_error(core),
            AppError::Pipeline(PipelineError::Store(StoreError::Conflict(msg))) => {
                (StatusCode::CONFLICT, "CONFLICT", msg)
            }
            AppError::Pipeline(PipelineError::Store(StoreError::Unavailable(msg))) => {
                tracing::error!(error = %msg, "Task store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORE_UNAVAILABLE",
                    "Task storage is temporarily unavailable".to_string(),
                )
            }
            AppError::Pipeline(PipelineError::Store(StoreError::Database(err))) => {
                tracing::error!(error = %err, "Database error");
                internal()
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify_core_error(err: CoreError) -> (StatusCode, &'static str, String) {
    match err {
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
        CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal core error");
            internal()
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}
