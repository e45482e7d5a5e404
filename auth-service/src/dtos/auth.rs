use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use crate::models::{AuthEvent, UserResponse};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    #[default]
    Email,
    Sms,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,

    #[validate(length(min = 6, max = 72, message = "Password must be 6 to 72 characters"))]
    #[schema(example = "secret1", min_length = 6, max_length = 72)]
    pub password: String,

    #[validate(length(min = 5, max = 20, message = "Invalid phone number"))]
    #[schema(example = "+15550001234")]
    pub phone: Option<String>,

    /// Where to send the verification message. Defaults to email.
    #[serde(default)]
    pub verification_method: Option<VerificationMethod>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    #[schema(example = 42)]
    pub id: i64,
    #[schema(example = "user@example.com")]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "secret1")]
    pub password: String,
}

/// Tokens travel in cookies; the body only reports the user and lifetimes.
#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub user: UserResponse,
    #[schema(example = 900)]
    pub access_expires_in: u64,
    #[schema(example = 2592000)]
    pub refresh_expires_in: u64,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RefreshRequest {
    /// Falls back to the `refreshToken` cookie when absent.
    #[schema(example = "eyJhbGciOiJIUzI1NiJ9...")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SuccessResponse {
    #[schema(example = true)]
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Deserialize, Validate, IntoParams)]
pub struct VerifyEmailQuery {
    #[validate(length(min = 1, message = "Token is required"))]
    #[param(example = "3f2b8c0e9d5a4c7e8f1a2b3c4d5e6f70")]
    pub token: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct VerifyPhoneRequest {
    #[validate(length(min = 5, max = 20, message = "Invalid phone number"))]
    #[schema(example = "+15550001234")]
    pub phone: String,

    #[validate(length(equal = 6, message = "Code must be 6 digits"))]
    #[schema(example = "123456")]
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyResponse {
    #[schema(example = true)]
    pub verified: bool,
    #[schema(example = 42)]
    pub user_id: i64,
}

pub const DEFAULT_LOG_LIMIT: usize = 50;
pub const MAX_LOG_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct LogsQuery {
    /// Number of newest events, 1 to 500. Defaults to 50.
    #[param(example = 50)]
    pub limit: Option<usize>,
}

impl LogsQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LOG_LIMIT)
            .clamp(1, MAX_LOG_LIMIT)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LogsResponse {
    pub events: Vec<AuthEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_limit_is_clamped() {
        assert_eq!(LogsQuery::default().effective_limit(), 50);
        assert_eq!(LogsQuery { limit: Some(0) }.effective_limit(), 1);
        assert_eq!(LogsQuery { limit: Some(10_000) }.effective_limit(), 500);
        assert_eq!(LogsQuery { limit: Some(7) }.effective_limit(), 7);
    }

    #[test]
    fn register_rejects_short_password() {
        let req: RegisterRequest =
            serde_json::from_str(r#"{"email":"a@x.com","password":"abc"}"#).unwrap();
        assert!(req.validate().is_err());
        assert_eq!(req.verification_method, None);
    }

    #[test]
    fn register_accepts_sms_method() {
        let req: RegisterRequest = serde_json::from_str(
            r#"{"email":"a@x.com","password":"secret1","phone":"+15550001","verification_method":"sms"}"#,
        )
        .unwrap();
        assert!(req.validate().is_ok());
        assert_eq!(req.verification_method, Some(VerificationMethod::Sms));
    }

    #[test]
    fn unknown_verification_method_fails_to_parse() {
        let parsed = serde_json::from_str::<RegisterRequest>(
            r#"{"email":"a@x.com","password":"secret1","verification_method":"pigeon"}"#,
        );
        assert!(parsed.is_err());
    }
}
