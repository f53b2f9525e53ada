//! Engine error types.
//!
//! Proxy responses are plain text: clients of the proxy are Kubernetes
//! tooling that only cares about the status code. Expired tokens get their
//! own body so CLIs can prompt for a fresh login; every other auth failure
//! is a bare `unauthorized`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Token is past its expiry; the caller should log in again.
    #[error("token expired")]
    Expired,

    /// Any other authentication failure.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Registry call failed.
    #[error("registry error: {0}")]
    Registry(String),

    /// Cluster API call failed.
    #[error("kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    /// Failed to forward a request upstream.
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Bad or missing engine configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Error::Registry(msg.into())
    }

    pub fn proxy(msg: impl Into<String>) -> Self {
        Error::Proxy(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Error::Expired => (StatusCode::UNAUTHORIZED, "expired"),
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Error::Proxy(_) => (StatusCode::BAD_GATEWAY, "bad gateway"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "proxy request failed");
        } else {
            tracing::debug!(error = %self, "proxy request rejected");
        }
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_and_unauthorized_are_distinct_bodies() {
        let expired = Error::Expired.into_response();
        assert_eq!(expired.status(), StatusCode::UNAUTHORIZED);

        let unauthorized = Error::unauthorized("bad signature").into_response();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
    }
}
