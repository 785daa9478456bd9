//! Error vocabulary surfaced by the account service.
//!
//! Every variant maps to a stable wire code so the HTTP layer (and any
//! future transport) can translate without string-matching messages.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("username or password is not in an acceptable format")]
    FormatInvalid,

    #[error("username is already taken")]
    Taken,

    #[error("account not found")]
    NotFound,

    #[error("account is locked")]
    Locked,

    #[error("credentials did not match")]
    Failed,

    #[error("password must be changed before authenticating")]
    PasswordExpired,

    #[error("password does not meet the strength requirement")]
    InsecurePassword,

    #[error("session is missing, expired, or revoked")]
    SessionInvalid,

    #[error("token is invalid, expired, or already used")]
    TokenInvalid,

    #[error("no configured application domain matches the request origin")]
    UnknownAudience,

    #[error("password reset webhook failed: {0}")]
    WebhookFailed(String),

    #[error("backend store error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl ServiceError {
    /// Stable wire code for the HTTP layer.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::FormatInvalid => "FORMAT_INVALID",
            Self::Taken => "TAKEN",
            Self::NotFound => "NOT_FOUND",
            Self::Locked => "LOCKED",
            Self::Failed => "FAILED",
            Self::PasswordExpired => "EXPIRED",
            Self::InsecurePassword => "INSECURE",
            Self::SessionInvalid => "SESSION_INVALID",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::UnknownAudience => "UNKNOWN_AUDIENCE",
            Self::WebhookFailed(_) => "WEBHOOK_FAILED",
            Self::Backend(_) => "BACKEND",
        }
    }

    /// Form field the error is reported against, when one applies.
    #[must_use]
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::FormatInvalid | Self::Taken => Some("username"),
            Self::PasswordExpired | Self::InsecurePassword => Some("password"),
            Self::NotFound | Self::Locked | Self::Failed => Some("credentials"),
            Self::SessionInvalid => Some("session"),
            Self::TokenInvalid => Some("token"),
            Self::UnknownAudience => Some("audience"),
            Self::WebhookFailed(_) | Self::Backend(_) => None,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::FormatInvalid
            | Self::Taken
            | Self::PasswordExpired
            | Self::InsecurePassword => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Locked | Self::Failed | Self::SessionInvalid | Self::TokenInvalid => {
                StatusCode::UNAUTHORIZED
            }
            Self::UnknownAudience => StatusCode::FORBIDDEN,
            Self::WebhookFailed(_) => StatusCode::BAD_GATEWAY,
            Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.into())
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.into())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if let Self::Backend(ref err) = self {
            tracing::error!("backend error: {err:#}");
        }
        let status = self.status();
        let body = Json(json!({
            "errors": [{
                "field": self.field(),
                "message": self.code(),
            }]
        }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ServiceError::FormatInvalid.code(), "FORMAT_INVALID");
        assert_eq!(ServiceError::Taken.code(), "TAKEN");
        assert_eq!(ServiceError::NotFound.code(), "NOT_FOUND");
        assert_eq!(ServiceError::Locked.code(), "LOCKED");
        assert_eq!(ServiceError::Failed.code(), "FAILED");
        assert_eq!(ServiceError::PasswordExpired.code(), "EXPIRED");
        assert_eq!(ServiceError::InsecurePassword.code(), "INSECURE");
        assert_eq!(ServiceError::SessionInvalid.code(), "SESSION_INVALID");
        assert_eq!(ServiceError::TokenInvalid.code(), "TOKEN_INVALID");
        assert_eq!(ServiceError::UnknownAudience.code(), "UNKNOWN_AUDIENCE");
    }

    #[test]
    fn credential_errors_are_4xx_and_backend_is_5xx() {
        assert_eq!(ServiceError::Failed.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ServiceError::Taken.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ServiceError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ServiceError::Backend(anyhow::anyhow!("store down")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServiceError::WebhookFailed("502".to_string()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn fields_target_the_offending_input() {
        assert_eq!(ServiceError::Taken.field(), Some("username"));
        assert_eq!(ServiceError::InsecurePassword.field(), Some("password"));
        assert_eq!(ServiceError::Failed.field(), Some("credentials"));
        assert_eq!(
            ServiceError::Backend(anyhow::anyhow!("store down")).field(),
            None
        );
    }
}
