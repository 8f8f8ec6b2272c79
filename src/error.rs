use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

/// One entry of a 422 `details[]` array. Validation, state-machine, and
/// nested-write failures all collect these so a client can fix the whole
/// payload in one round-trip.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub message: String,
}

impl ValidationDetail {
    pub fn field(field: impl Into<String>, rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            relation: None,
            rule: Some(rule.into()),
            index: None,
            message: message.into(),
        }
    }

    pub fn relation(relation: impl Into<String>, index: usize, message: impl Into<String>) -> Self {
        Self {
            field: None,
            relation: Some(relation.into()),
            rule: None,
            index: Some(index),
            message: message.into(),
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            field: None,
            relation: None,
            rule: None,
            index: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    UnknownField(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    UnknownEntity(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Validation failed")]
    Validation(Vec<ValidationDetail>),
    #[error("Nested write failed")]
    NestedWriteFailed(Vec<ValidationDetail>),
    #[error("{0}")]
    UnprocessableEntity(String),
    #[error("{0}")]
    Dependency(String),
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::UnknownField(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) | AppError::UnknownEntity(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Validation(_)
            | AppError::NestedWriteFailed(_)
            | AppError::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Dependency(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "INVALID_PAYLOAD",
            AppError::UnknownField(_) => "UNKNOWN_FIELD",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::UnknownEntity(_) => "UNKNOWN_ENTITY",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Validation(_) | AppError::UnprocessableEntity(_) => "VALIDATION_FAILED",
            AppError::NestedWriteFailed(_) => "NESTED_WRITE_FAILED",
            AppError::Dependency(_) | AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn detail_message(&self) -> String {
        match self {
            AppError::Validation(details) | AppError::NestedWriteFailed(details) => details
                .iter()
                .map(|d| d.message.clone())
                .collect::<Vec<_>>()
                .join("; "),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let body = match &self {
            AppError::Validation(details) | AppError::NestedWriteFailed(details) => json!({
                "error": {
                    "code": code,
                    "message": self.detail_message(),
                    "details": details,
                }
            }),
            // Internal failure text stays in the logs, not the response.
            AppError::Dependency(message) | AppError::Internal(message) => {
                tracing::error!(error = %message, "Request failed with internal error");
                json!({
                    "error": {
                        "code": code,
                        "message": "An unexpected error occurred.",
                    }
                })
            }
            other => json!({
                "error": {
                    "code": code,
                    "message": other.to_string(),
                }
            }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_code_follow_the_taxonomy() {
        let cases: Vec<(AppError, StatusCode, &str)> = vec![
            (
                AppError::BadRequest("bad".into()),
                StatusCode::BAD_REQUEST,
                "INVALID_PAYLOAD",
            ),
            (
                AppError::UnknownField("nope".into()),
                StatusCode::BAD_REQUEST,
                "UNKNOWN_FIELD",
            ),
            (
                AppError::Unauthorized("no token".into()),
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
            ),
            (
                AppError::UnknownEntity("ghost".into()),
                StatusCode::NOT_FOUND,
                "UNKNOWN_ENTITY",
            ),
            (
                AppError::Validation(vec![ValidationDetail::message("x")]),
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_FAILED",
            ),
            (
                AppError::NestedWriteFailed(vec![ValidationDetail::relation("items", 0, "x")]),
                StatusCode::UNPROCESSABLE_ENTITY,
                "NESTED_WRITE_FAILED",
            ),
            (
                AppError::Dependency("db down".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
            ),
        ];
        for (error, status, code) in cases {
            assert_eq!(error.status(), status);
            assert_eq!(error.code(), code);
        }
    }

    #[test]
    fn validation_detail_serializes_sparsely() {
        let detail = ValidationDetail::field("total", "min_amount", "total must be positive");
        let value = serde_json::to_value(&detail).unwrap();
        assert_eq!(value["field"], "total");
        assert_eq!(value["rule"], "min_amount");
        assert!(value.get("relation").is_none());
        assert!(value.get("index").is_none());
    }

    #[test]
    fn detail_message_joins_entries() {
        let error = AppError::Validation(vec![
            ValidationDetail::message("first"),
            ValidationDetail::message("second"),
        ]);
        assert_eq!(error.detail_message(), "first; second");
    }
}
