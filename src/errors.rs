use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub type AppResult<T> = Result<T, AppError>;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("no permission derivable for {method} {path}")]
    DerivationAmbiguous { method: String, path: String },
    #[error("unknown permission code: {0}")]
    UnknownPermission(String),
    #[error("unknown role: {0}")]
    UnknownRole(i64),
    #[error("grants for role {role_id} changed during reconciliation; retry")]
    ReconcileConflict { role_id: i64 },
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn invalid_policy(message: impl Into<String>) -> Self {
        Self::InvalidPolicy(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Store connectivity failures abort a whole reconciliation run; everything
    /// else is recorded against the role being processed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            )
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::DerivationAmbiguous { .. } => "derivation_ambiguous",
            AppError::UnknownPermission(_) => "unknown_permission",
            AppError::UnknownRole(_) => "unknown_role",
            AppError::ReconcileConflict { .. } => "reconcile_conflict",
            AppError::InvalidPolicy(_) => "invalid_policy",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::BadRequest(_) => "bad_request",
            AppError::Configuration(_) => "configuration",
            AppError::Database(_) => "database",
            AppError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::DerivationAmbiguous { .. } => StatusCode::FORBIDDEN,
            AppError::UnknownPermission(_) => StatusCode::NOT_FOUND,
            AppError::UnknownRole(_) => StatusCode::NOT_FOUND,
            AppError::ReconcileConflict { .. } => StatusCode::CONFLICT,
            AppError::InvalidPolicy(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Derivation details stay server-side.
        let message = match &self {
            AppError::DerivationAmbiguous { .. } => "forbidden: insufficient permissions".to_string(),
            other => other.to_string(),
        };

        let payload = ErrorResponse {
            error: self.kind().to_string(),
            message,
        };

        (status, Json(payload)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}
