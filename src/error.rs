use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// One entry of a 422 response's `details` array.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ValidationDetail {
    pub field: String,
    pub rule: String,
    pub message: String,
}

impl ValidationDetail {
    pub fn new(
        field: impl Into<String>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            rule: rule.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unknown entity '{0}'.")]
    UnknownEntity(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Unknown field(s): {}.", .0.join(", "))]
    UnknownField(Vec<String>),

    #[error("{0}")]
    BadRequest(String),

    #[error("Validation failed.")]
    Validation(Vec<ValidationDetail>),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("App '{0}' not found.")]
    AppNotFound(String),

    #[error("{0}")]
    Dependency(String),

    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::UnknownEntity(_) => "UNKNOWN_ENTITY",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::UnknownField(_) => "UNKNOWN_FIELD",
            AppError::BadRequest(_) => "INVALID_PAYLOAD",
            AppError::Validation(_) => "VALIDATION_FAILED",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::AppNotFound(_) => "APP_NOT_FOUND",
            AppError::Dependency(_) | AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::UnknownEntity(_) | AppError::NotFound(_) | AppError::AppNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AppError::UnknownField(_) | AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Dependency(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn detail_message(&self) -> String {
        self.to_string()
    }

    /// Single-entry VALIDATION_FAILED, for callers with one known failure.
    pub fn validation(
        field: impl Into<String>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        AppError::Validation(vec![ValidationDetail::new(field, rule, message)])
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }

        let mut error = json!({
            "code": self.code(),
            "message": self.detail_message(),
        });

        match &self {
            AppError::Validation(details) => {
                error["details"] = json!(details);
            }
            AppError::UnknownField(fields) => {
                let details: Vec<ValidationDetail> = fields
                    .iter()
                    .map(|field| {
                        ValidationDetail::new(
                            field.clone(),
                            "unknown_field",
                            format!("'{field}' is not a field or relation of this entity."),
                        )
                    })
                    .collect();
                error["details"] = json!(details);
            }
            _ => {}
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        map_db_error(error)
    }
}

/// Translate low-level sqlx failures into the public taxonomy. The
/// unique-violation sentinel (SQLSTATE 23505) surfaces as CONFLICT; anything
/// else is an internal failure.
pub fn map_db_error(error: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.code().as_deref() == Some("23505") {
            return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
        }
    }

    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Internal("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_statuses() {
        let cases: Vec<(AppError, &str, StatusCode)> = vec![
            (
                AppError::UnknownEntity("order".into()),
                "UNKNOWN_ENTITY",
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::NotFound("record missing".into()),
                "NOT_FOUND",
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::UnknownField(vec!["bogus".into()]),
                "UNKNOWN_FIELD",
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                AppError::BadRequest("bad body".into()),
                "INVALID_PAYLOAD",
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::Validation(vec![]),
                "VALIDATION_FAILED",
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                AppError::Conflict("dup".into()),
                "CONFLICT",
                StatusCode::CONFLICT,
            ),
            (
                AppError::Unauthorized("no token".into()),
                "UNAUTHORIZED",
                StatusCode::UNAUTHORIZED,
            ),
            (
                AppError::Forbidden("nope".into()),
                "FORBIDDEN",
                StatusCode::FORBIDDEN,
            ),
            (
                AppError::AppNotFound("crm".into()),
                "APP_NOT_FOUND",
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::Internal("boom".into()),
                "INTERNAL_ERROR",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, code, status) in cases {
            assert_eq!(error.code(), code);
            assert_eq!(error.status(), status);
        }
    }

    #[test]
    fn unknown_field_message_lists_keys() {
        let error = AppError::UnknownField(vec!["a".into(), "b".into()]);
        assert_eq!(error.detail_message(), "Unknown field(s): a, b.");
    }

    #[test]
    fn validation_helper_builds_single_detail() {
        let error = AppError::validation("status", "state_machine", "blocked");
        match error {
            AppError::Validation(details) => {
                assert_eq!(details.len(), 1);
                assert_eq!(details[0].field, "status");
                assert_eq!(details[0].rule, "state_machine");
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }
}
