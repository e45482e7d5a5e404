use axum::http::StatusCode;
use service_core::error::AppError;
use thiserror::Error;

/// Failures of the session core and the verification flows.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Device id is required")]
    MissingDevice,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token payload is missing required claims")]
    MalformedPayload,

    #[error("Session revoked")]
    SessionRevoked,

    #[error("Session expired")]
    SessionExpired,

    #[error("Refresh token has been superseded")]
    JtiMismatch,

    #[error("Refresh token does not match session")]
    HashMismatch,

    #[error("User not found")]
    UserNotFound,

    #[error("Email already in use")]
    EmailInUse,

    #[error("Phone already in use")]
    PhoneInUse,

    #[error("Invalid or expired verification")]
    InvalidVerification,

    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[source] anyhow::Error),
}

impl AuthError {
    /// Stable machine-readable code, also used as the failure reason in the event log.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingDevice => "MISSING_DEVICE",
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::InvalidToken => "INVALID_TOKEN",
            AuthError::TokenExpired => "TOKEN_EXPIRED",
            AuthError::MalformedPayload => "MALFORMED_PAYLOAD",
            AuthError::SessionRevoked => "SESSION_REVOKED",
            AuthError::SessionExpired => "SESSION_EXPIRED",
            AuthError::JtiMismatch => "JTI_MISMATCH",
            AuthError::HashMismatch => "HASH_MISMATCH",
            AuthError::UserNotFound => "USER_NOT_FOUND",
            AuthError::EmailInUse => "EMAIL_IN_USE",
            AuthError::PhoneInUse => "PHONE_IN_USE",
            AuthError::InvalidVerification => "INVALID_VERIFICATION",
            AuthError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            AuthError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingDevice | AuthError::InvalidVerification => StatusCode::BAD_REQUEST,
            AuthError::EmailInUse | AuthError::PhoneInUse => StatusCode::CONFLICT,
            AuthError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Wrap a backing-store failure.
    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        AuthError::StoreUnavailable(err.into())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::StoreUnavailable(e) => {
                tracing::error!(error = %e, "Backing store unavailable");
                AppError::ServiceUnavailable
            }
            AuthError::Internal(e) => AppError::InternalError(e),
            other => AppError::domain(other.status(), other.code(), other.to_string()),
        }
    }
}
