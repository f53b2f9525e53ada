//! Registry error taxonomy.
//!
//! The store returns typed kinds; the API layer translates them to HTTP
//! statuses. Authentication failures collapse to a single 401 on the wire so
//! responses never reveal which factor failed. 500s carry an opaque incident
//! id; the detail goes to the log.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use infra_common::api::{ErrorResponse, FieldError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request failed field validation. Lists every offending field.
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    /// Any authentication failure: missing, expired, or invalid credential.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but missing the required grant.
    #[error("forbidden")]
    Forbidden,

    /// Row does not exist, or belongs to another organization.
    #[error("{kind} not found")]
    NotFound { kind: &'static str },

    /// Uniqueness violation, e.g. a duplicate grant or user name.
    #[error("{kind} already exists")]
    Duplicate { kind: &'static str },

    /// Access key lookup failed; collapses to 401 on the wire.
    #[error("access key not found")]
    AccessKeyNotFound,

    /// Presented secret's checksum did not match; collapses to 401.
    #[error("access key invalid secret")]
    AccessKeyInvalidSecret,

    /// Key is past `expires_at`; collapses to 401.
    #[error("access key expired")]
    AccessKeyExpired,

    /// Key is past `extension_deadline`; collapses to 401.
    #[error("access key deadline exceeded")]
    AccessKeyDeadlineExceeded,

    /// Login budget for this (ip, username) is exhausted.
    #[error("too many login attempts")]
    RateLimited,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &'static str) -> Self {
        Error::NotFound { kind }
    }

    pub fn duplicate(kind: &'static str) -> Self {
        Error::Duplicate { kind }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Single-field validation failure.
    pub fn field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Validation(vec![FieldError {
            field: field.into(),
            errors: vec![msg.into()],
        }])
    }

    /// True for every kind that maps to 401.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Error::Unauthorized
                | Error::AccessKeyNotFound
                | Error::AccessKeyInvalidSecret
                | Error::AccessKeyExpired
                | Error::AccessKeyDeadlineExceeded
        )
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Error::Validation(fields) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    code: 400,
                    message: "validation failed".into(),
                    field_errors: fields.clone(),
                    incident_id: None,
                },
            ),
            Error::Unauthorized
            | Error::AccessKeyNotFound
            | Error::AccessKeyInvalidSecret
            | Error::AccessKeyExpired
            | Error::AccessKeyDeadlineExceeded => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse {
                    code: 401,
                    // Deliberately generic: do not reveal which factor failed.
                    message: "unauthorized".into(),
                    field_errors: vec![],
                    incident_id: None,
                },
            ),
            Error::Forbidden => (
                StatusCode::FORBIDDEN,
                ErrorResponse {
                    code: 403,
                    message: "forbidden".into(),
                    field_errors: vec![],
                    incident_id: None,
                },
            ),
            Error::NotFound { kind } => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    code: 404,
                    message: format!("{kind} not found"),
                    field_errors: vec![],
                    incident_id: None,
                },
            ),
            Error::Duplicate { kind } => (
                StatusCode::CONFLICT,
                ErrorResponse {
                    code: 409,
                    message: format!("{kind} already exists"),
                    field_errors: vec![],
                    incident_id: None,
                },
            ),
            Error::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse {
                    code: 429,
                    message: "too many requests".into(),
                    field_errors: vec![],
                    incident_id: None,
                },
            ),
            Error::Database(sqlx::Error::RowNotFound) => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    code: 404,
                    message: "record not found".into(),
                    field_errors: vec![],
                    incident_id: None,
                },
            ),
            Error::Database(_) | Error::Internal(_) => {
                let incident_id = uuid::Uuid::new_v4().to_string();
                error!(incident_id = %incident_id, error = %self, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        code: 500,
                        message: "internal error".into(),
                        field_errors: vec![],
                        incident_id: Some(incident_id),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_key_failures_collapse_to_unauthorized() {
        for err in [
            Error::AccessKeyNotFound,
            Error::AccessKeyInvalidSecret,
            Error::AccessKeyExpired,
            Error::AccessKeyDeadlineExceeded,
            Error::Unauthorized,
        ] {
            assert!(err.is_unauthorized());
            let resp = err.into_response();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn duplicate_maps_to_conflict() {
        let resp = Error::duplicate("grant").into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation_lists_every_field() {
        let err = Error::Validation(vec![
            FieldError {
                field: "name".into(),
                errors: vec!["is required".into()],
            },
            FieldError {
                field: "password".into(),
                errors: vec!["is required".into()],
            },
        ]);
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
