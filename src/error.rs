//! Error types for the Kerbernetes API server

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Main error type for Kerbernetes operations
///
/// Variants map one-to-one onto the HTTP statuses the auth endpoint can
/// produce, plus startup-only kinds that are fatal before the server binds.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Authentication failed: SPNEGO verification, LDAP bind, user not
    /// found, or an ambiguous directory result
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No authenticated principal attached to the request
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Requested functionality is not available in this configuration
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Kubernetes API or LDAP transport failure during the authenticated flow
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid configuration detected at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Keytab could not be loaded or the acceptor credential acquired
    #[error("keytab error: {0}")]
    Keytab(String),
}

impl Error {
    /// Create an unauthorized error with the given message
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a forbidden error with the given message
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a keytab error with the given message
    pub fn keytab(msg: impl Into<String>) -> Self {
        Self::Keytab(msg.into())
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Internal(format!("kubernetes api: {e}"))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            Error::NotImplemented(_) => (StatusCode::NOT_IMPLEMENTED, self.to_string()),
            // Internal details stay in the logs
            Error::Internal(_) | Error::Config(_) | Error::Keytab(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        let body = Json(serde_json::json!({ "error": message }));

        if status == StatusCode::UNAUTHORIZED {
            // RFC 4559: unauthorized responses carry the Negotiate challenge
            (status, [(header::WWW_AUTHENTICATE, "Negotiate")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
