use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::authz::UnknownRole;

pub type AppResult<T> = Result<T, AppError>;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),
    #[error("denied: {0}")]
    Denied(String),
    #[error("prerequisite missing: {0}")]
    PrerequisiteMissing(String),
    #[error("last owner protected: {0}")]
    LastOwnerProtected(String),
    #[error("invalid tenant selection: {0}")]
    InvalidTenantSelection(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("token error: {0}")]
    Token(String),
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_authenticated(message: impl Into<String>) -> Self {
        Self::NotAuthenticated(message.into())
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::Denied(message.into())
    }

    pub fn prerequisite_missing(message: impl Into<String>) -> Self {
        Self::PrerequisiteMissing(message.into())
    }

    pub fn last_owner_protected(message: impl Into<String>) -> Self {
        Self::LastOwnerProtected(message.into())
    }

    pub fn invalid_tenant_selection(message: impl Into<String>) -> Self {
        Self::InvalidTenantSelection(message.into())
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

    pub fn token(err: impl Into<String>) -> Self {
        Self::Token(err.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotAuthenticated(_) => "not_authenticated",
            AppError::Denied(_) => "denied",
            AppError::PrerequisiteMissing(_) => "prerequisite_missing",
            AppError::LastOwnerProtected(_) => "last_owner_protected",
            AppError::InvalidTenantSelection(_) => "invalid_tenant_selection",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::BadRequest(_) => "bad_request",
            AppError::Configuration(_) => "configuration",
            AppError::Token(_) => "token",
            AppError::Database(_) => "database",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotAuthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Denied(_) => StatusCode::FORBIDDEN,
            AppError::PrerequisiteMissing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::LastOwnerProtected(_) => StatusCode::CONFLICT,
            AppError::InvalidTenantSelection(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Token(_) => StatusCode::UNAUTHORIZED,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
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
        let status = self.status();

        if let AppError::Database(err) = &self {
            tracing::error!(error = %err, "database error");
        }

        let payload = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        };

        (status, Json(payload)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<UnknownRole> for AppError {
    fn from(value: UnknownRole) -> Self {
        Self::Internal(value.to_string())
    }
}
